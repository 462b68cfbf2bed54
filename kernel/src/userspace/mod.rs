//! Embedded gatekeeper program
//!
//! The first ring-3 task. With no file-backed executables, the program is
//! a hand-assembled blob baked into the kernel: it spins the wheel of
//! fate, announces itself over `write`, and exits cleanly. One page of
//! code, one message, nothing else.

use crate::error::{KernelError, KernelResult};
use crate::mm::page_table::PageFlags;
use crate::mm::user_validation::copy_to_user;
use crate::mm::vas;
use crate::sched::scheduler;
use crate::sched::task::{TaskFlags, TaskId};
use crate::sched::task_management;

/// Where the code page lands in every gatekeeper address space.
pub const GATEKEEPER_LOAD_ADDR: u64 = 0x40_0000;

/// Offset of the greeting inside the code page.
const MSG_OFFSET: usize = 0x100;

const MSG: &[u8] = b"the gatekeeper lives\n";

/// Image size: one page.
const IMAGE_SIZE: usize = 4096;

/// Assemble the gatekeeper image.
///
/// ```text
/// mov eax, 4            ; roulette_spin
/// int 0x80
/// mov eax, 2            ; write
/// mov edi, 0x400100     ; message address
/// mov esi, MSG_LEN
/// int 0x80
/// mov eax, 1            ; exit
/// xor edi, edi
/// int 0x80
/// jmp $                 ; unreachable backstop
/// ```
fn image() -> [u8; IMAGE_SIZE] {
    let mut img = [0u8; IMAGE_SIZE];
    let msg_addr = (GATEKEEPER_LOAD_ADDR as u32 + MSG_OFFSET as u32).to_le_bytes();
    let msg_len = (MSG.len() as u32).to_le_bytes();

    let mut code = [0u8; 35];
    let mut i = 0;
    let mut emit = |bytes: &[u8]| {
        code[i..i + bytes.len()].copy_from_slice(bytes);
        i += bytes.len();
    };
    emit(&[0xB8, 0x04, 0x00, 0x00, 0x00]); // mov eax, 4
    emit(&[0xCD, 0x80]); // int 0x80
    emit(&[0xB8, 0x02, 0x00, 0x00, 0x00]); // mov eax, 2
    emit(&[0xBF, msg_addr[0], msg_addr[1], msg_addr[2], msg_addr[3]]); // mov edi, msg
    emit(&[0xBE, msg_len[0], msg_len[1], msg_len[2], msg_len[3]]); // mov esi, len
    emit(&[0xCD, 0x80]); // int 0x80
    emit(&[0xB8, 0x01, 0x00, 0x00, 0x00]); // mov eax, 1
    emit(&[0x31, 0xFF]); // xor edi, edi
    emit(&[0xCD, 0x80]); // int 0x80
    emit(&[0xEB, 0xFE]); // jmp $
    let len = i;

    img[..len].copy_from_slice(&code[..len]);
    img[MSG_OFFSET..MSG_OFFSET + MSG.len()].copy_from_slice(MSG);
    img
}

/// Create the gatekeeper task: a fresh process VM with the image mapped
/// user-executable at [`GATEKEEPER_LOAD_ADDR`].
pub fn spawn_gatekeeper() -> KernelResult<TaskId> {
    let id = task_management::task_create(
        "gatekeeper",
        GATEKEEPER_LOAD_ADDR,
        0,
        TaskFlags::USER_MODE,
        10,
    )?;
    let pid = scheduler::task_process_id(id).ok_or(KernelError::TaskNotFound { id })?;
    vas::process_vm_map_user(
        pid,
        GATEKEEPER_LOAD_ADDR,
        IMAGE_SIZE as u64,
        PageFlags::WRITABLE,
    )?;
    let pml4 = vas::process_vm_get_page_dir(pid).ok_or(KernelError::ProcessNotFound { pid })?;

    // The page was just mapped user-writable in a directory nothing runs
    // on yet; copy the image through the HHDM aliases.
    let img = image();
    for (chunk_idx, chunk) in img.chunks(512).enumerate() {
        copy_to_user(
            pml4,
            GATEKEEPER_LOAD_ADDR + (chunk_idx * 512) as u64,
            chunk,
        )?;
    }
    Ok(id)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_image_layout() {
        let img = image();
        // First instruction selects roulette_spin.
        assert_eq!(&img[..5], &[0xB8, 0x04, 0x00, 0x00, 0x00]);
        // The int 0x80 trap follows immediately.
        assert_eq!(&img[5..7], &[0xCD, 0x80]);
        // Message sits at its advertised offset.
        assert_eq!(&img[MSG_OFFSET..MSG_OFFSET + MSG.len()], MSG);
        // The backstop loop terminates the code.
        let code_end = 35;
        assert_eq!(&img[code_end - 2..code_end], &[0xEB, 0xFE]);
    }
}
