//! Language items and default exception handlers for bare ARM targets

#[cfg(all(feature = "defmt", target_arch = "arm", not(feature = "hosted")))]
use defmt_rtt as _;

#[cfg(all(feature = "defmt", target_arch = "arm", not(feature = "hosted")))]
use panic_probe as _;

// Defmt panic handler
#[cfg(all(feature = "defmt", target_arch = "arm", not(feature = "hosted")))]
#[defmt::panic_handler]
fn defmt_panic() -> ! {
    cortex_m::asm::udf()
}

// Panic handler when defmt is disabled
#[cfg(all(not(feature = "defmt"), target_arch = "arm", not(feature = "hosted")))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {
        cortex_m::asm::udf();
    }
}

// Default HardFault handler
#[cfg(all(target_arch = "arm", not(feature = "hosted")))]
#[cortex_m_rt::exception]
unsafe fn HardFault(_ef: &cortex_m_rt::ExceptionFrame) -> ! {
    loop {
        cortex_m::asm::udf();
    }
}

// Defmt timestamp in ticks
#[cfg(all(feature = "defmt", target_arch = "arm", not(feature = "hosted")))]
defmt::timestamp!("{=u32}", crate::port::tick_now());
