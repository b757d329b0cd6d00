use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide drain flag. Readiness reports not-ready once it flips.
#[derive(Debug, Default)]
pub struct ShutdownState {
    draining: AtomicBool,
}

impl ShutdownState {
    /// Returns true only for the caller that flipped the flag.
    pub fn begin_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_drain_flips_once() {
        let state = ShutdownState::default();
        assert!(!state.is_draining());
        assert!(state.begin_drain());
        assert!(!state.begin_drain());
        assert!(state.is_draining());
    }
}
