pub mod endpoint;
pub mod flow_control;
pub mod publication;
pub mod retransmit;

use weir_concurrent::CountersManager;

/// Conductor-side hooks a publication calls back into while the conductor
/// ticks it. One implementation per driver; tests stub it.
pub trait DriverConductor {
    fn counters_mut(&mut self) -> &mut CountersManager;

    /// Unlink any spy subscriptions still attached; the publication frees
    /// their position counters afterwards.
    fn cleanup_spies(&mut self, registration_id: i64);

    /// The linger window ended; schedule destruction once the sender thread
    /// acknowledges release.
    fn retire_publication(&mut self, registration_id: i64);
}
