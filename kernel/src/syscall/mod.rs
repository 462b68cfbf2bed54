//! System call interface
//!
//! User code traps to vector 0x80 with the call number in RAX and up to
//! three arguments in RDI/RSI/RDX; the result comes back in RAX with -1
//! meaning error (unknown numbers included). Every buffer crossing the
//! boundary is bounded and validated page-by-page; a failed validation
//! costs the caller a loss on the wheel of fate.
//!
//! The trap dispatcher has already captured the user context into the TCB
//! when a handler runs, so handlers that give up the CPU (yield, sleep,
//! exit) write their return value into the saved context first and then
//! reschedule.

use log::{info, warn};

use crate::arch::x86_64::idt::TrapFrame;
use crate::mm::user_validation::{
    self, copy_from_user, copy_path_from_user, copy_to_user, USER_COPY_MAX, USER_PATH_MAX,
};
use crate::mm::vas;
use crate::sched::scheduler;
use crate::sched::task_management;
use crate::{fs, video, wheel};

/// System call numbers.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Yield = 0,
    Exit = 1,
    Write = 2,
    Read = 3,
    RouletteSpin = 4,
    RouletteResult = 5,
    SleepMs = 6,
    FbInfo = 7,
    GfxFillRect = 8,
    GfxDrawLine = 9,
    GfxDrawCircle = 10,
    GfxDrawCircleFilled = 11,
    FontDraw = 12,
    RandomNext = 13,
    FsOpen = 14,
    FsClose = 15,
    FsRead = 16,
    FsWrite = 17,
    FsStat = 18,
    FsMkdir = 19,
    FsUnlink = 20,
    FsList = 21,
    SysInfo = 22,
    Halt = 23,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Syscall::Yield,
            1 => Syscall::Exit,
            2 => Syscall::Write,
            3 => Syscall::Read,
            4 => Syscall::RouletteSpin,
            5 => Syscall::RouletteResult,
            6 => Syscall::SleepMs,
            7 => Syscall::FbInfo,
            8 => Syscall::GfxFillRect,
            9 => Syscall::GfxDrawLine,
            10 => Syscall::GfxDrawCircle,
            11 => Syscall::GfxDrawCircleFilled,
            12 => Syscall::FontDraw,
            13 => Syscall::RandomNext,
            14 => Syscall::FsOpen,
            15 => Syscall::FsClose,
            16 => Syscall::FsRead,
            17 => Syscall::FsWrite,
            18 => Syscall::FsStat,
            19 => Syscall::FsMkdir,
            20 => Syscall::FsUnlink,
            21 => Syscall::FsList,
            22 => Syscall::SysInfo,
            23 => Syscall::Halt,
            _ => return Err(()),
        })
    }
}

/// Dispatch a syscall trap frame. Called from the trap dispatcher with
/// the user context already captured into the TCB.
pub fn syscall_handle(frame: &mut TrapFrame) {
    scheduler::with_current_task(|t| t.in_syscall = true);

    let ret = match Syscall::try_from(frame.rax) {
        Ok(call) => dispatch(call, frame),
        Err(()) => {
            warn!("syscall: unknown number {}", frame.rax);
            -1
        }
    };

    // The live frame iretqs back to user; the saved TCB copy resumes the
    // task if a later preemption switches it out first.
    frame.rax = ret as u64;
    scheduler::with_current_task(|t| {
        t.context.rax = ret as u64;
        t.in_syscall = false;
    });
}

fn dispatch(call: Syscall, frame: &mut TrapFrame) -> i64 {
    let (a0, a1, a2) = (frame.rdi, frame.rsi, frame.rdx);
    match call {
        Syscall::Yield => {
            set_saved_return(frame, 0);
            scheduler::yield_current();
            0
        }
        Syscall::Exit => task_management::task_exit(a0 as i32),
        Syscall::Write => sys_write(a0, a1 as usize),
        Syscall::Read => sys_read(a0, a1 as usize),
        Syscall::RouletteSpin => wheel::spin() as i64,
        Syscall::RouletteResult => sys_roulette_result(a0),
        Syscall::SleepMs => {
            set_saved_return(frame, 0);
            scheduler::sleep_ms(a0);
            0
        }
        Syscall::FbInfo => sys_fb_info(a0),
        Syscall::GfxFillRect => sys_gfx_fill_rect(a0),
        Syscall::GfxDrawLine => sys_gfx_draw_line(a0),
        Syscall::GfxDrawCircle => sys_gfx_draw_circle(a0, false),
        Syscall::GfxDrawCircleFilled => sys_gfx_draw_circle(a0, true),
        Syscall::FontDraw => sys_font_draw(a0, a1, a2),
        Syscall::RandomNext => (wheel::rand_next() & i64::MAX as u64) as i64,
        Syscall::FsOpen => sys_fs_open(a0, a1),
        Syscall::FsClose => sys_fs_close(a0),
        Syscall::FsRead => sys_fs_read(a0, a1, a2 as usize),
        Syscall::FsWrite => sys_fs_write(a0, a1, a2 as usize),
        Syscall::FsStat => sys_fs_stat(a0, a1),
        Syscall::FsMkdir => sys_fs_path_only(a0, fs::mkdir),
        Syscall::FsUnlink => sys_fs_path_only(a0, fs::unlink),
        Syscall::FsList => sys_fs_list(a0, a1, a2 as usize),
        Syscall::SysInfo => sys_info(a0),
        Syscall::Halt => sys_halt(a0),
    }
}

/// For handlers that may never return to this trap: make the saved
/// context carry the return value before the CPU is given away.
fn set_saved_return(frame: &mut TrapFrame, ret: i64) {
    frame.rax = ret as u64;
    scheduler::with_current_task(|t| t.context.rax = ret as u64);
}

/// Page directory of the calling process. Runs the one-time kernel-page
/// trip-wire the first time any task crosses the boundary.
fn caller_pml4() -> Option<u64> {
    let pid = scheduler::current_process_id()?;
    if pid == vas::INVALID_PROCESS_ID {
        return None;
    }
    let pml4 = vas::process_vm_get_page_dir(pid)?;
    user_validation::self_check(pml4);
    Some(pml4)
}

/// Validation failure: -1 and a loss on the ledger.
fn deny() -> i64 {
    let _ = wheel::record_loss();
    -1
}

fn sys_write(buf: u64, len: usize) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let len = len.min(USER_COPY_MAX);
    if len == 0 {
        return -1;
    }
    let mut data = [0u8; USER_COPY_MAX];
    if copy_from_user(pml4, buf, &mut data[..len]).is_err() {
        return deny();
    }
    if let Ok(text) = core::str::from_utf8(&data[..len]) {
        crate::print!("{}", text);
    } else {
        for &b in &data[..len] {
            crate::print!("{}", b as char);
        }
    }
    len as i64
}

fn sys_read(buf: u64, len: usize) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let len = len.min(USER_COPY_MAX);
    if len == 0 {
        return -1;
    }
    // Console input is not wired up; an empty, validated read keeps the
    // contract honest.
    if !user_validation::validate_user_range(pml4, buf, len) {
        return deny();
    }
    0
}

fn sys_roulette_result(selector: u64) -> i64 {
    let stats = wheel::stats();
    match selector {
        0 => stats.wins as i64,
        1 => stats.losses as i64,
        2 => stats.threshold as i64,
        _ => -1,
    }
}

fn sys_fb_info(user_ptr: u64) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let Some(fb) = video::fb_info() else {
        return -1;
    };
    let mut buf = [0u8; 5 * 8];
    for (i, v) in [fb.width, fb.height, fb.pitch, fb.bpp, fb.phys_base]
        .iter()
        .enumerate()
    {
        buf[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
    }
    if copy_to_user(pml4, user_ptr, &buf).is_err() {
        return deny();
    }
    0
}

/// Copy a fixed-size argument struct of `N` little-endian u32 fields.
fn copy_u32_args<const N: usize>(pml4: u64, user_ptr: u64) -> Option<[u32; N]> {
    let mut raw = [0u8; 128];
    let bytes = N * 4;
    copy_from_user(pml4, user_ptr, &mut raw[..bytes]).ok()?;
    let mut out = [0u32; N];
    for (i, v) in out.iter_mut().enumerate() {
        *v = u32::from_le_bytes(raw[i * 4..(i + 1) * 4].try_into().unwrap());
    }
    Some(out)
}

fn sys_gfx_fill_rect(user_ptr: u64) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let Some([x, y, w, h, color]) = copy_u32_args::<5>(pml4, user_ptr) else {
        return deny();
    };
    match video::fill_rect(x, y, w, h, color) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_gfx_draw_line(user_ptr: u64) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let Some([x0, y0, x1, y1, color]) = copy_u32_args::<5>(pml4, user_ptr) else {
        return deny();
    };
    match video::draw_line(x0, y0, x1, y1, color) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_gfx_draw_circle(user_ptr: u64, filled: bool) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let Some([cx, cy, radius, color]) = copy_u32_args::<4>(pml4, user_ptr) else {
        return deny();
    };
    match video::draw_circle(cx, cy, radius, color, filled) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_font_draw(text_ptr: u64, xy: u64, color: u64) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let mut path = [0u8; USER_PATH_MAX];
    let Ok(len) = copy_path_from_user(pml4, text_ptr, &mut path) else {
        return deny();
    };
    let Ok(text) = core::str::from_utf8(&path[..len]) else {
        return -1;
    };
    let x = (xy >> 32) as u32;
    let y = (xy & 0xFFFF_FFFF) as u32;
    match video::font_draw(x, y, color as u32, text) {
        Ok(()) => len as i64,
        Err(_) => -1,
    }
}

fn read_path(pml4: u64, user_ptr: u64, buf: &mut [u8; USER_PATH_MAX]) -> Option<usize> {
    copy_path_from_user(pml4, user_ptr, buf).ok()
}

fn sys_fs_open(path_ptr: u64, flags: u64) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let mut path = [0u8; USER_PATH_MAX];
    let Some(len) = read_path(pml4, path_ptr, &mut path) else {
        return deny();
    };
    let Ok(path) = core::str::from_utf8(&path[..len]) else {
        return -1;
    };
    match fs::open(path, flags & fs::OPEN_CREATE != 0) {
        Ok(handle) => handle as i64,
        Err(_) => -1,
    }
}

fn sys_fs_close(handle: u64) -> i64 {
    match fs::close(handle as u32) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_fs_read(handle: u64, buf: u64, len: usize) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let len = len.min(USER_COPY_MAX);
    if len == 0 {
        return -1;
    }
    let mut data = [0u8; USER_COPY_MAX];
    let n = match fs::read(handle as u32, &mut data[..len]) {
        Ok(n) => n,
        Err(_) => return -1,
    };
    if n > 0 && copy_to_user(pml4, buf, &data[..n]).is_err() {
        return deny();
    }
    n as i64
}

fn sys_fs_write(handle: u64, buf: u64, len: usize) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let len = len.min(USER_COPY_MAX);
    if len == 0 {
        return -1;
    }
    let mut data = [0u8; USER_COPY_MAX];
    if copy_from_user(pml4, buf, &mut data[..len]).is_err() {
        return deny();
    }
    match fs::write(handle as u32, &data[..len]) {
        Ok(n) => n as i64,
        Err(_) => -1,
    }
}

fn sys_fs_stat(path_ptr: u64, stat_ptr: u64) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let mut path = [0u8; USER_PATH_MAX];
    let Some(len) = read_path(pml4, path_ptr, &mut path) else {
        return deny();
    };
    let Ok(path) = core::str::from_utf8(&path[..len]) else {
        return -1;
    };
    let (size, is_dir) = match fs::stat(path) {
        Ok(s) => s,
        Err(_) => return -1,
    };
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&size.to_le_bytes());
    buf[8..].copy_from_slice(&(is_dir as u64).to_le_bytes());
    if copy_to_user(pml4, stat_ptr, &buf).is_err() {
        return deny();
    }
    0
}

fn sys_fs_path_only(path_ptr: u64, op: fn(&str) -> crate::error::KernelResult<()>) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let mut path = [0u8; USER_PATH_MAX];
    let Some(len) = read_path(pml4, path_ptr, &mut path) else {
        return deny();
    };
    let Ok(path) = core::str::from_utf8(&path[..len]) else {
        return -1;
    };
    match op(path) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_fs_list(path_ptr: u64, buf: u64, len: usize) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let mut path = [0u8; USER_PATH_MAX];
    let Some(plen) = read_path(pml4, path_ptr, &mut path) else {
        return deny();
    };
    let Ok(path) = core::str::from_utf8(&path[..plen]) else {
        return -1;
    };
    let len = len.min(USER_COPY_MAX);
    if len == 0 {
        return -1;
    }
    let mut data = [0u8; USER_COPY_MAX];
    let n = match fs::list(path, &mut data[..len]) {
        Ok(n) => n,
        Err(_) => return -1,
    };
    if n > 0 && copy_to_user(pml4, buf, &data[..n]).is_err() {
        return deny();
    }
    n as i64
}

fn sys_info(user_ptr: u64) -> i64 {
    let Some(pml4) = caller_pml4() else {
        return deny();
    };
    let (total_frames, free_frames) = {
        let alloc = crate::mm::FRAME_ALLOCATOR.lock();
        (alloc.total_usable_frames(), alloc.free_frame_count())
    };
    let heap = crate::mm::heap::stats();
    let wheel_stats = wheel::stats();
    let fields: [u64; 9] = [
        total_frames,
        free_frames,
        heap.allocated_size as u64,
        heap.free_size as u64,
        scheduler::task_count() as u64,
        crate::arch::x86_64::timer::ticks(),
        scheduler::context_switch_count(),
        wheel_stats.wins,
        wheel_stats.losses,
    ];
    let mut buf = [0u8; 9 * 8];
    for (i, v) in fields.iter().enumerate() {
        buf[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
    }
    if copy_to_user(pml4, user_ptr, &buf).is_err() {
        return deny();
    }
    0
}

/// The shutdown ritual: the exit code is logged and the machine stops.
fn sys_halt(code: u64) -> ! {
    info!("halt requested (code {})", code);
    crate::arch::halt_loop();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_numbering() {
        assert_eq!(Syscall::try_from(0), Ok(Syscall::Yield));
        assert_eq!(Syscall::try_from(4), Ok(Syscall::RouletteSpin));
        assert_eq!(Syscall::try_from(23), Ok(Syscall::Halt));
        assert_eq!(Syscall::try_from(24), Err(()));
        assert_eq!(Syscall::try_from(u64::MAX), Err(()));
    }

    #[test]
    fn test_roulette_result_selectors() {
        assert!(sys_roulette_result(0) >= 0);
        assert!(sys_roulette_result(1) >= 0);
        assert!(sys_roulette_result(2) > 0);
        assert_eq!(sys_roulette_result(99), -1);
    }

    #[test]
    fn test_unknown_syscall_returns_minus_one() {
        let mut frame = test_frame(500, 0, 0, 0);
        syscall_handle(&mut frame);
        assert_eq!(frame.rax as i64, -1);
    }

    #[test]
    fn test_random_next_is_non_negative() {
        for _ in 0..32 {
            let v = (wheel::rand_next() & i64::MAX as u64) as i64;
            assert!(v >= 0);
        }
    }

    #[test]
    fn test_write_without_process_denied() {
        // No current task on the host harness: every user-memory syscall
        // must fail closed and charge a loss.
        let losses_before = wheel::stats().losses;
        assert_eq!(sys_write(0x40_0000, 16), -1);
        assert!(wheel::stats().losses > losses_before);
    }

    fn test_frame(rax: u64, rdi: u64, rsi: u64, rdx: u64) -> TrapFrame {
        TrapFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi,
            rsi,
            rbp: 0,
            rbx: 0,
            rdx,
            rcx: 0,
            rax,
            vector: 0x80,
            error_code: 0,
            rip: 0x40_0000,
            cs: 0x23,
            rflags: 0x202,
            rsp: 0x7FFF_0000,
            ss: 0x1B,
        }
    }
}
