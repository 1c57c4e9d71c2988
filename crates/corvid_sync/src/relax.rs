/// What a spinning CPU does between two attempts to take the lock.
pub trait Relax {
    fn relax();
}

/// Issue the architectural spin-wait hint.
pub struct SpinRelax;

/// Plain busy loop, for environments where the hint is unavailable.
pub struct LoopRelax;

impl Relax for SpinRelax {
    fn relax() {
        core::hint::spin_loop();
    }
}

impl Relax for LoopRelax {
    fn relax() {}
}
