//! The board-support contract the kernel core consumes.
//!
//! Everything else a real board needs — clock init, NVIC configuration,
//! GPIO/UART/SPI/DMA/ADC drivers — is a client of the kernel, not a
//! dependency of it, and has no representation here.

/// Functions the core calls into the board support package for.
///
/// Implementations are expected to be zero-sized or hold only a handle to
/// the relevant peripheral; the kernel stores one `B: Bsp` by value inside
/// [`crate::kernel::Kernel`].
pub trait Bsp {
    /// Disable interrupts up to the kernel's configured priority mask and
    /// return an opaque token that restores the prior state.
    fn irq_save_disable(&self) -> u32;

    /// Undo a previous [`Bsp::irq_save_disable`].
    fn irq_restore(&self, state: u32);

    /// Unconditionally unmask all interrupts. Used once at boot after
    /// `kernel_init`, never inside a critical section.
    fn irq_enable_all(&self);

    /// Unconditionally mask all interrupts.
    fn irq_disable_all(&self);

    /// Pend the software exception that performs the next context switch.
    /// A no-op is acceptable if called again before the pending switch runs.
    fn trigger_context_switch(&self);

    /// Program the periodic tick source for the given frequency.
    fn tick_configure(&self, hz: u32);

    /// Tickless mode only: reprogram the tick source to fire `delta` ticks
    /// from now instead of at the next periodic boundary.
    fn tick_stretch_until(&self, delta: u32);

    /// Free-running cycle counter, used only for optional trace stamps.
    fn cycle_counter(&self) -> u32;

    /// Count leading zeros, as the scheduler's bitmap search needs.
    fn clz(&self, x: u32) -> u32 {
        x.leading_zeros()
    }

    /// Count trailing zeros.
    fn ctz(&self, x: u32) -> u32 {
        x.trailing_zeros()
    }
}
