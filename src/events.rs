/// Structured events the engine reports through an injected sink.
///
/// The engine never prints; it reports. The CLI/logging front-end, which
/// is out of scope for this crate, is expected to map these to log lines
/// or metrics of its choosing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `allocate()` returned `NONE`; the RAM pool was full.
    AllocationFailure { sensor: Option<u32> },
    /// RAM occupancy crossed a 10% boundary, in either direction.
    ThresholdCrossed { percent_used: u8 },
    /// A disk file was moved to the quarantine directory.
    Quarantined { handle: crate::handle::ExtendedHandle, reason: &'static str },
    /// The tiered controller changed state.
    ControllerStateChanged { from: crate::tiered::ControllerState, to: crate::tiered::ControllerState },
    /// A migration batch for one chain completed.
    MigrationCompleted { sensor: u32, sectors_freed: u32 },
    /// A chain was quarantined after an invariant violation in a release
    /// build; new writes to it are dropped until operator
    /// intervention.
    ChainQuarantined { sensor: u32, detail: &'static str },
}

/// Receives [`Event`]s emitted by the engine.
///
/// Implemented for any `FnMut(Event)` closure so callers can wire up a
/// logging adapter, a metrics counter, or a test probe with a plain
/// closure instead of a bespoke type.
pub trait EventSink {
    fn emit(&mut self, event: Event);
}

impl<F: FnMut(Event)> EventSink for F {
    fn emit(&mut self, event: Event) {
        self(event)
    }
}

/// An [`EventSink`] that drops every event. Used as the default sink when
/// the caller does not need to observe them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: Event) {}
}
