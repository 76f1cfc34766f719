//! Name-service timing constants (§4.3.2), tunable at runtime.

/// TTL, in seconds, announced in every IsAt this daemon emits.
pub const DURATION: u8 = 120;
/// Sentinel TTL meaning "never expires".
pub const DURATION_INFINITE: u8 = crate::wire::DURATION_INFINITE;
/// Period at which an advertising daemon reemits its active set.
pub const RETRANSMIT_SECS: u64 = 80;
/// Silence from a remote after which this daemon starts probing it.
pub const QUESTION_SECS: u64 = 30;
/// Probe cadence once the question window has opened.
pub const QUESTION_MODULUS_SECS: u64 = 10;
/// Additional WhoHas retransmissions beyond the first.
pub const RETRIES: u32 = 2;
/// Gap between WhoHas retransmissions.
pub const RETRY_INTERVAL_SECS: u64 = 5;

/// A mutable copy of the timing constants above, settable via
/// [`crate::ns::Engine::set_critical_parameters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timers {
    pub duration: u8,
    pub retransmit_secs: u64,
    pub question_secs: u64,
    pub question_modulus_secs: u64,
    pub retries: u32,
    pub retry_interval_secs: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            duration: DURATION,
            retransmit_secs: RETRANSMIT_SECS,
            question_secs: QUESTION_SECS,
            question_modulus_secs: QUESTION_MODULUS_SECS,
            retries: RETRIES,
            retry_interval_secs: RETRY_INTERVAL_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ratios() {
        let t = Timers::default();
        assert_eq!(t.retransmit_secs, t.duration as u64 * 2 / 3);
        assert_eq!(t.question_secs, t.duration as u64 / 4);
    }
}
