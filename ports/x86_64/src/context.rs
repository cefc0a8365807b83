//! Interrupt-frame based context switching.
//!
//! A thread that is not running keeps its registers in an [`IntrFrame`]
//! stored inside its [`Context`]. Switching saves the outgoing registers in
//! the same layout the interrupt entry stubs push, then loads the incoming
//! frame and resumes it with `iretq`. A new thread's frame is built by
//! [`prepare_frame`] so that `iretq` lands on its entry function.

use core::arch::naked_asm;
use core::mem::{align_of, offset_of, size_of};

use kthread::platform::{Context, EntryFn};
use static_assertions::{const_assert, const_assert_eq};

/// Reserved RFLAGS bit that always reads as one.
pub const FLAG_MBS: u64 = 1 << 1;
/// RFLAGS interrupt enable flag.
pub const FLAG_IF: u64 = 1 << 9;

/// General-purpose registers in push order of the interrupt entry stubs.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GpRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// Saved CPU state of a thread, laid out like an interrupt stack frame.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IntrFrame {
    pub regs: GpRegisters,
    pub es: u64,
    pub ds: u64,
    pub vec_no: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const_assert_eq!(size_of::<IntrFrame>(), 192);
const_assert!(size_of::<IntrFrame>() <= size_of::<Context>());
const_assert!(align_of::<IntrFrame>() <= align_of::<Context>());

/// Segment selectors loaded into a new thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selectors {
    pub code: u16,
    pub data: u16,
}

impl Selectors {
    /// Kernel code and data segments of the usual flat GDT.
    pub const KERNEL: Selectors = Selectors {
        code: 0x08,
        data: 0x10,
    };
}

impl Default for Selectors {
    fn default() -> Self {
        Self::KERNEL
    }
}

/// Views a saved context as an interrupt frame.
pub fn frame(ctx: &Context) -> &IntrFrame {
    // SAFETY: size and alignment are checked above and every bit pattern is
    // a valid `IntrFrame`.
    unsafe { &*(ctx as *const Context).cast::<IntrFrame>() }
}

pub fn frame_mut(ctx: &mut Context) -> &mut IntrFrame {
    // SAFETY: as in `frame`.
    unsafe { &mut *(ctx as *mut Context).cast::<IntrFrame>() }
}

/// Builds the frame of a thread that has never run: `iretq` enters
/// `entry(arg)` with interrupts disabled, as if it had just been called on
/// an empty stack ending at `stack_top`.
pub fn prepare_frame(
    ctx: &mut Context,
    stack_top: usize,
    entry: EntryFn,
    arg: usize,
    selectors: Selectors,
) {
    let frame = frame_mut(ctx);
    *frame = IntrFrame::default();
    frame.rip = entry as usize as u64;
    frame.regs.rdi = arg as u64;
    // room for the return address a call would have pushed
    frame.rsp = (stack_top - 8) as u64;
    frame.rflags = FLAG_MBS;
    frame.cs = u64::from(selectors.code);
    frame.ss = u64::from(selectors.data);
    frame.ds = u64::from(selectors.data);
    frame.es = u64::from(selectors.data);
}

/// Saves the running state into `from` and resumes `to`.
///
/// The saved frame resumes at the end of this function with the caller's
/// return address on the stack, so a later switch back returns normally.
///
/// # Safety
///
/// Interrupts must be disabled, `from` must be writable and `to` must hold
/// a frame written by this function or by [`prepare_frame`].
#[unsafe(naked)]
pub unsafe extern "C" fn switch_frames(from: *mut Context, to: *const Context) {
    naked_asm!(
        // rdi = from, rsi = to
        "mov [rdi + {off_r15}], r15",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_r11}], r11",
        "mov [rdi + {off_r10}], r10",
        "mov [rdi + {off_r9}], r9",
        "mov [rdi + {off_r8}], r8",
        "mov [rdi + {off_rsi}], rsi",
        "mov [rdi + {off_rdi}], rdi",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_rdx}], rdx",
        "mov [rdi + {off_rcx}], rcx",
        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_rax}], rax",
        "xor eax, eax",
        "mov ax, es",
        "mov [rdi + {off_es}], rax",
        "mov ax, ds",
        "mov [rdi + {off_ds}], rax",
        "mov ax, cs",
        "mov [rdi + {off_cs}], rax",
        "mov ax, ss",
        "mov [rdi + {off_ss}], rax",
        "lea rax, [rip + 2f]",
        "mov [rdi + {off_rip}], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + {off_rflags}], rax",
        "mov [rdi + {off_rsp}], rsp",
        // From here on only the incoming frame is used.
        "mov rsp, rsi",
        "mov rax, [rsp + {off_es}]",
        "mov es, ax",
        "mov rax, [rsp + {off_ds}]",
        "mov ds, ax",
        "mov r15, [rsp + {off_r15}]",
        "mov r14, [rsp + {off_r14}]",
        "mov r13, [rsp + {off_r13}]",
        "mov r12, [rsp + {off_r12}]",
        "mov r11, [rsp + {off_r11}]",
        "mov r10, [rsp + {off_r10}]",
        "mov r9, [rsp + {off_r9}]",
        "mov r8, [rsp + {off_r8}]",
        "mov rsi, [rsp + {off_rsi}]",
        "mov rdi, [rsp + {off_rdi}]",
        "mov rbp, [rsp + {off_rbp}]",
        "mov rdx, [rsp + {off_rdx}]",
        "mov rcx, [rsp + {off_rcx}]",
        "mov rbx, [rsp + {off_rbx}]",
        "mov rax, [rsp + {off_rax}]",
        "add rsp, {off_rip}",
        "iretq",
        "2:",
        "ret",
        off_r15 = const offset_of!(GpRegisters, r15),
        off_r14 = const offset_of!(GpRegisters, r14),
        off_r13 = const offset_of!(GpRegisters, r13),
        off_r12 = const offset_of!(GpRegisters, r12),
        off_r11 = const offset_of!(GpRegisters, r11),
        off_r10 = const offset_of!(GpRegisters, r10),
        off_r9 = const offset_of!(GpRegisters, r9),
        off_r8 = const offset_of!(GpRegisters, r8),
        off_rsi = const offset_of!(GpRegisters, rsi),
        off_rdi = const offset_of!(GpRegisters, rdi),
        off_rbp = const offset_of!(GpRegisters, rbp),
        off_rdx = const offset_of!(GpRegisters, rdx),
        off_rcx = const offset_of!(GpRegisters, rcx),
        off_rbx = const offset_of!(GpRegisters, rbx),
        off_rax = const offset_of!(GpRegisters, rax),
        off_es = const offset_of!(IntrFrame, es),
        off_ds = const offset_of!(IntrFrame, ds),
        off_rip = const offset_of!(IntrFrame, rip),
        off_cs = const offset_of!(IntrFrame, cs),
        off_rflags = const offset_of!(IntrFrame, rflags),
        off_rsp = const offset_of!(IntrFrame, rsp),
        off_ss = const offset_of!(IntrFrame, ss),
    );
}
