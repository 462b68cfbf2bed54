//! RAM filesystem
//!
//! Fixed node table, heap-backed file contents, nothing persistent. This
//! is the whole backing store for the fs_* syscalls; contents live only
//! until reboot. Paths are absolute, `/`-separated, at most 127 bytes.

use alloc::vec::Vec;
use log::debug;
use spin::Mutex;

use crate::error::{FsError, KernelResult};

/// Maximum number of nodes (files + directories, root included).
const MAX_NODES: usize = 32;

/// Maximum open handles, table-global.
const MAX_HANDLES: usize = 8;

/// Per-file size cap.
const MAX_FILE_SIZE: usize = 16 * 1024;

/// Component name cap (NUL excluded).
const MAX_NAME: usize = 31;

/// `fs_open` flag: create the file if it does not exist.
pub const OPEN_CREATE: u64 = 1;

const NO_NODE: u8 = u8::MAX;

struct Node {
    used: bool,
    is_dir: bool,
    parent: u8,
    name: [u8; MAX_NAME + 1],
    name_len: u8,
    data: Vec<u8>,
}

impl Node {
    const EMPTY: Node = Node {
        used: false,
        is_dir: false,
        parent: NO_NODE,
        name: [0; MAX_NAME + 1],
        name_len: 0,
        data: Vec::new(),
    };

    fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        self.name[..bytes.len()].copy_from_slice(bytes);
        self.name_len = bytes.len() as u8;
    }
}

#[derive(Clone, Copy)]
struct Handle {
    used: bool,
    node: u8,
    pos: u32,
}

impl Handle {
    const EMPTY: Handle = Handle {
        used: false,
        node: NO_NODE,
        pos: 0,
    };
}

struct RamFs {
    nodes: [Node; MAX_NODES],
    handles: [Handle; MAX_HANDLES],
    root_ready: bool,
}

impl RamFs {
    const fn new() -> Self {
        Self {
            nodes: [const { Node::EMPTY }; MAX_NODES],
            handles: [Handle::EMPTY; MAX_HANDLES],
            root_ready: false,
        }
    }

    fn ensure_root(&mut self) {
        if !self.root_ready {
            self.nodes[0].used = true;
            self.nodes[0].is_dir = true;
            self.nodes[0].parent = NO_NODE;
            self.root_ready = true;
        }
    }

    fn child_of(&self, dir: u8, name: &str) -> Option<u8> {
        (0..MAX_NODES as u8).find(|&i| {
            let n = &self.nodes[i as usize];
            n.used && n.parent == dir && n.name_str() == name
        })
    }

    /// Resolve a path to (parent directory, final component, node if it
    /// exists). The final component may be missing; every intermediate
    /// component must exist and be a directory.
    fn resolve<'p>(&mut self, path: &'p str) -> KernelResult<(u8, &'p str, Option<u8>)> {
        self.ensure_root();
        if !path.starts_with('/') {
            return Err(FsError::BadPath.into());
        }
        let mut dir = 0u8;
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        let Some(mut component) = components.next() else {
            // The root itself.
            return Ok((NO_NODE, "/", Some(0)));
        };
        loop {
            if component.len() > MAX_NAME {
                return Err(FsError::NameTooLong.into());
            }
            let found = self.child_of(dir, component);
            if components.peek().is_none() {
                return Ok((dir, component, found));
            }
            match found {
                Some(idx) if self.nodes[idx as usize].is_dir => dir = idx,
                Some(_) => return Err(FsError::NotADirectory.into()),
                None => return Err(FsError::NotFound.into()),
            }
            component = components.next().unwrap();
        }
    }

    fn alloc_node(&mut self) -> KernelResult<u8> {
        (1..MAX_NODES as u8)
            .find(|&i| !self.nodes[i as usize].used)
            .ok_or_else(|| FsError::NoSpace.into())
    }

    fn open(&mut self, path: &str, create: bool) -> KernelResult<u32> {
        let (parent, name, found) = self.resolve(path)?;
        let node = match found {
            Some(idx) => {
                if self.nodes[idx as usize].is_dir {
                    return Err(FsError::IsADirectory.into());
                }
                idx
            }
            None => {
                if !create {
                    return Err(FsError::NotFound.into());
                }
                let idx = self.alloc_node()?;
                let n = &mut self.nodes[idx as usize];
                n.used = true;
                n.is_dir = false;
                n.parent = parent;
                n.set_name(name);
                n.data = Vec::new();
                debug!("ramfs: created '{}'", path);
                idx
            }
        };
        let slot = self
            .handles
            .iter()
            .position(|h| !h.used)
            .ok_or(FsError::NoSpace)?;
        self.handles[slot] = Handle {
            used: true,
            node,
            pos: 0,
        };
        Ok(slot as u32)
    }

    fn handle(&self, handle: u32) -> KernelResult<Handle> {
        let h = *self
            .handles
            .get(handle as usize)
            .ok_or(FsError::BadHandle)?;
        if !h.used {
            return Err(FsError::BadHandle.into());
        }
        Ok(h)
    }

    fn close(&mut self, handle: u32) -> KernelResult<()> {
        self.handle(handle)?;
        self.handles[handle as usize] = Handle::EMPTY;
        Ok(())
    }

    fn read(&mut self, handle: u32, buf: &mut [u8]) -> KernelResult<usize> {
        let h = self.handle(handle)?;
        let data = &self.nodes[h.node as usize].data;
        let pos = h.pos as usize;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.handles[handle as usize].pos += n as u32;
        Ok(n)
    }

    fn write(&mut self, handle: u32, buf: &[u8]) -> KernelResult<usize> {
        let h = self.handle(handle)?;
        let pos = h.pos as usize;
        if pos + buf.len() > MAX_FILE_SIZE {
            return Err(FsError::NoSpace.into());
        }
        let data = &mut self.nodes[h.node as usize].data;
        if pos + buf.len() > data.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        self.handles[handle as usize].pos += buf.len() as u32;
        Ok(buf.len())
    }

    fn stat(&mut self, path: &str) -> KernelResult<(u64, bool)> {
        let (_, _, found) = self.resolve(path)?;
        let idx = found.ok_or(FsError::NotFound)?;
        let n = &self.nodes[idx as usize];
        Ok((n.data.len() as u64, n.is_dir))
    }

    fn mkdir(&mut self, path: &str) -> KernelResult<()> {
        let (parent, name, found) = self.resolve(path)?;
        if found.is_some() {
            return Err(FsError::AlreadyExists.into());
        }
        let idx = self.alloc_node()?;
        let n = &mut self.nodes[idx as usize];
        n.used = true;
        n.is_dir = true;
        n.parent = parent;
        n.set_name(name);
        n.data = Vec::new();
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> KernelResult<()> {
        let (_, _, found) = self.resolve(path)?;
        let idx = found.ok_or(FsError::NotFound)?;
        if idx == 0 {
            return Err(FsError::BadPath.into());
        }
        if self.nodes[idx as usize].is_dir
            && (0..MAX_NODES).any(|i| self.nodes[i].used && self.nodes[i].parent == idx)
        {
            return Err(FsError::DirectoryNotEmpty.into());
        }
        // Drop open handles pointing at the node.
        for h in self.handles.iter_mut() {
            if h.used && h.node == idx {
                *h = Handle::EMPTY;
            }
        }
        self.nodes[idx as usize] = Node::EMPTY;
        Ok(())
    }

    fn list(&mut self, path: &str, buf: &mut [u8]) -> KernelResult<usize> {
        let (_, _, found) = self.resolve(path)?;
        let idx = found.ok_or(FsError::NotFound)?;
        if !self.nodes[idx as usize].is_dir {
            return Err(FsError::NotADirectory.into());
        }
        let mut written = 0;
        for i in 0..MAX_NODES {
            let n = &self.nodes[i];
            if !n.used || n.parent != idx {
                continue;
            }
            let name = n.name_str().as_bytes();
            if written + name.len() + 1 > buf.len() {
                break;
            }
            buf[written..written + name.len()].copy_from_slice(name);
            buf[written + name.len()] = b'\n';
            written += name.len() + 1;
        }
        Ok(written)
    }
}

static RAMFS: Mutex<RamFs> = Mutex::new(RamFs::new());

pub fn open(path: &str, create: bool) -> KernelResult<u32> {
    RAMFS.lock().open(path, create)
}

pub fn close(handle: u32) -> KernelResult<()> {
    RAMFS.lock().close(handle)
}

pub fn read(handle: u32, buf: &mut [u8]) -> KernelResult<usize> {
    RAMFS.lock().read(handle, buf)
}

pub fn write(handle: u32, buf: &[u8]) -> KernelResult<usize> {
    RAMFS.lock().write(handle, buf)
}

pub fn stat(path: &str) -> KernelResult<(u64, bool)> {
    RAMFS.lock().stat(path)
}

pub fn mkdir(path: &str) -> KernelResult<()> {
    RAMFS.lock().mkdir(path)
}

pub fn unlink(path: &str) -> KernelResult<()> {
    RAMFS.lock().unlink(path)
}

pub fn list(path: &str, buf: &mut [u8]) -> KernelResult<usize> {
    RAMFS.lock().list(path, buf)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn fresh() -> RamFs {
        let mut fs = RamFs::new();
        fs.ensure_root();
        fs
    }

    #[test]
    fn test_create_write_read_round_trip() {
        let mut fs = fresh();
        let h = fs.open("/hello.txt", true).expect("create must succeed");
        assert_eq!(fs.write(h, b"slop").unwrap(), 4);
        fs.close(h).unwrap();

        let h = fs.open("/hello.txt", false).expect("reopen existing");
        let mut buf = [0u8; 16];
        let n = fs.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"slop");
        assert_eq!(fs.read(h, &mut buf).unwrap(), 0, "EOF after the content");
        fs.close(h).unwrap();
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let mut fs = fresh();
        assert!(fs.open("/nope", false).is_err());
    }

    #[test]
    fn test_mkdir_and_nested_paths() {
        let mut fs = fresh();
        fs.mkdir("/etc").unwrap();
        assert!(fs.mkdir("/etc").is_err(), "duplicate mkdir");
        let h = fs.open("/etc/motd", true).unwrap();
        fs.write(h, b"welcome").unwrap();
        fs.close(h).unwrap();
        assert_eq!(fs.stat("/etc/motd").unwrap(), (7, false));
        assert_eq!(fs.stat("/etc").unwrap().1, true);
        assert!(fs.open("/missing/x", true).is_err(), "intermediate must exist");
    }

    #[test]
    fn test_unlink_rules() {
        let mut fs = fresh();
        fs.mkdir("/d").unwrap();
        let h = fs.open("/d/f", true).unwrap();
        fs.close(h).unwrap();
        assert!(fs.unlink("/d").is_err(), "non-empty directory");
        fs.unlink("/d/f").unwrap();
        fs.unlink("/d").unwrap();
        assert!(fs.stat("/d").is_err());
        assert!(fs.unlink("/").is_err(), "root is not removable");
    }

    #[test]
    fn test_listing() {
        let mut fs = fresh();
        fs.mkdir("/bin").unwrap();
        for name in ["/bin/sh", "/bin/ls"] {
            let h = fs.open(name, true).unwrap();
            fs.close(h).unwrap();
        }
        let mut buf = [0u8; 64];
        let n = fs.list("/bin", &mut buf).unwrap();
        let listing = core::str::from_utf8(&buf[..n]).unwrap();
        assert!(listing.contains("sh\n"));
        assert!(listing.contains("ls\n"));
    }

    #[test]
    fn test_file_size_cap() {
        let mut fs = fresh();
        let h = fs.open("/big", true).unwrap();
        let chunk = [0u8; 512];
        for _ in 0..(MAX_FILE_SIZE / 512) {
            fs.write(h, &chunk).unwrap();
        }
        assert!(fs.write(h, &chunk).is_err(), "cap must hold");
    }

    #[test]
    fn test_handle_exhaustion_and_reuse() {
        let mut fs = fresh();
        let h0 = fs.open("/f", true).unwrap();
        let mut handles = alloc::vec::Vec::new();
        loop {
            match fs.open("/f", false) {
                Ok(h) => handles.push(h),
                Err(_) => break,
            }
        }
        assert_eq!(handles.len(), MAX_HANDLES - 1);
        fs.close(h0).unwrap();
        assert!(fs.open("/f", false).is_ok(), "closed slot is reusable");
    }

    #[test]
    fn test_name_too_long() {
        let mut fs = fresh();
        let long = "/this-name-is-way-longer-than-the-thirty-one-byte-component-cap";
        assert!(fs.open(long, true).is_err());
    }
}
