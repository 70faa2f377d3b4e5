//! Cortex-M context switch machinery
//!
//! PendSV performs the switch, SysTick drives the kernel tick. The
//! non-ARM half is a set of inert stubs so the backend type-checks on
//! development hosts.

#![allow(named_asm_labels)]

#[cfg(not(target_arch = "arm"))]
use crate::task::TaskFn;

#[cfg(not(target_arch = "arm"))]
use super::tcb::StkElement;

#[cfg(target_arch = "arm")]
mod cortex_m_impl {
    use core::arch::{asm, naked_asm};

    use cortex_m::peripheral::scb::SystemHandler;
    use cortex_m::peripheral::syst::SystClkSource;

    use crate::config::{CFG_CPU_CLOCK_HZ, CFG_TICK_RATE_HZ};
    use crate::task::TaskFn;

    use super::super::tcb::StkElement;
    use super::super::CPU_STATE;

    /// Dedicated MSP stack for exception handling
    #[no_mangle]
    static mut INTERRUPT_STACK: [u64; 256] = [0; 256];

    fn systick_init(cnts: u32) {
        let mut p = unsafe { cortex_m::Peripherals::steal() };
        p.SYST.set_reload(cnts - 1);
        p.SYST.clear_current();
        p.SYST.set_clock_source(SystClkSource::Core);
        p.SYST.enable_interrupt();
        p.SYST.enable_counter();
    }

    pub(crate) fn start_first_task() {
        unsafe {
            let mut scb = cortex_m::Peripherals::steal().SCB;

            // PendSV and SysTick at the lowest priority so they never
            // preempt application interrupts mid-switch
            scb.set_priority(SystemHandler::PendSV, 0xF0);
            scb.set_priority(SystemHandler::SysTick, 0xF0);

            systick_init(CFG_CPU_CLOCK_HZ / CFG_TICK_RATE_HZ);

            // Exceptions run on their own stack from here on
            let msp_top = (&raw const INTERRUPT_STACK) as usize as u32
                + core::mem::size_of::<[u64; 256]>() as u32;
            asm!("msr msp, {0}", in(reg) msp_top);
            asm!("msr psp, {0}", in(reg) 0);

            // Null current task makes the first PendSV restore-only
            (*(&raw mut CPU_STATE)).tcb_cur = core::ptr::null_mut();

            cortex_m::interrupt::enable();
            cortex_m::peripheral::SCB::set_pendsv();
        }
    }

    #[inline(always)]
    pub(crate) fn trigger_ctx_switch() {
        cortex_m::peripheral::SCB::set_pendsv();
    }

    #[inline(always)]
    pub(crate) fn wait_for_interrupt() {
        cortex_m::asm::wfi();
    }

    /// Context frame as PendSV lays it out on the process stack
    #[repr(C, align(4))]
    struct CtxFrame {
        r4: u32,
        r5: u32,
        r6: u32,
        r7: u32,
        r8: u32,
        r9: u32,
        r10: u32,
        r11: u32,
        exc_return: u32,
        r0: u32,
        r1: u32,
        r2: u32,
        r3: u32,
        r12: u32,
        lr: u32,
        pc: u32,
        xpsr: u32,
    }
    const CTX_FRAME_WORDS: usize = 17;

    /// Build the initial context frame so the first switch into the task
    /// "returns" straight into its entry function
    pub(crate) unsafe fn stack_init(
        entry: TaskFn,
        arg: *mut (),
        stk_base: *mut StkElement,
        stk_size: usize,
    ) -> *mut StkElement {
        unsafe {
            let stk_top = stk_base.add(stk_size);
            let stk_aligned = ((stk_top as usize) & !7) as *mut u32;
            let frame = stk_aligned.sub(CTX_FRAME_WORDS) as *mut CtxFrame;

            (*frame) = CtxFrame {
                r4: 0,
                r5: 0,
                r6: 0,
                r7: 0,
                r8: 0,
                r9: 0,
                r10: 0,
                r11: 0,
                exc_return: 0xFFFF_FFFD,
                r0: arg as u32,
                r1: 0,
                r2: 0,
                r3: 0,
                r12: 0,
                lr: super::super::task_exit as *const () as u32,
                pc: (entry as usize as u32) | 1,
                xpsr: 0x0100_0000,
            };

            // One word below the frame to match PendSV's "add r0, r0, #4"
            (frame as *mut u32).sub(1) as *mut StkElement
        }
    }

    /// Swap the current TCB for the highest-ready one; returns the new
    /// task's saved stack pointer
    #[inline(never)]
    #[no_mangle]
    unsafe extern "C" fn pendsv_switch_context(cur_sp: *mut u32) -> *mut u32 {
        unsafe {
            let cpu = &mut *(&raw mut CPU_STATE);

            if !cpu.tcb_cur.is_null() {
                (*cpu.tcb_cur).stk_ptr = cur_sp;
            }
            cpu.tcb_cur = cpu.tcb_high_rdy;

            if cpu.tcb_cur.is_null() {
                core::ptr::null_mut()
            } else {
                (*cpu.tcb_cur).stk_ptr
            }
        }
    }

    /// PendSV exception: save R4-R11/LR to the outgoing task's process
    /// stack, swap TCBs, restore the incoming task's registers
    #[no_mangle]
    #[unsafe(naked)]
    pub unsafe extern "C" fn PendSV() {
        naked_asm!(
            "cpsid i",
            "dsb",
            "isb",

            "mrs r0, psp",

            "ldr r1, ={cpu_state}",
            "ldr r1, [r1]",
            "cbz r1, 1f",

            "stmdb r0!, {{r4-r11, lr}}",

            "sub r0, r0, #4",

            "1:",
            "bl pendsv_switch_context",

            "cbz r0, 2f",
            "add r0, r0, #4",
            "ldmia r0!, {{r4-r11, lr}}",

            "msr psp, r0",

            "2:",
            "cpsie i",
            "dsb",
            "isb",

            "bx lr",

            cpu_state = sym CPU_STATE,
        );
    }

    /// SysTick exception: drive the kernel tick
    #[no_mangle]
    pub extern "C" fn SysTick() {
        super::super::tick();
    }
}

#[cfg(target_arch = "arm")]
pub(crate) use cortex_m_impl::{start_first_task, trigger_ctx_switch, wait_for_interrupt};

#[cfg(target_arch = "arm")]
pub(crate) use cortex_m_impl::stack_init;

// Host stubs; this backend only runs for real on the ARM target
#[cfg(not(target_arch = "arm"))]
pub(crate) fn start_first_task() {}

#[cfg(not(target_arch = "arm"))]
#[inline(always)]
pub(crate) fn trigger_ctx_switch() {}

#[cfg(not(target_arch = "arm"))]
#[inline(always)]
pub(crate) fn wait_for_interrupt() {
    core::hint::spin_loop();
}

#[cfg(not(target_arch = "arm"))]
pub(crate) unsafe fn stack_init(
    _entry: TaskFn,
    _arg: *mut (),
    stk_base: *mut StkElement,
    stk_size: usize,
) -> *mut StkElement {
    unsafe { stk_base.add(stk_size) }
}
