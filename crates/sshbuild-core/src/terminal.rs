//! The invoking terminal, as seen by the process relay

use std::io;

/// Mode switching and size queries on the user's terminal
pub trait Terminal: Send + Sync {
    /// Switch to raw mode, remembering the previous mode
    fn enable_raw_mode(&self) -> io::Result<()>;
    /// Restore the mode saved by `enable_raw_mode`
    fn disable_raw_mode(&self) -> io::Result<()>;
    /// Current size as (columns, rows)
    fn size(&self) -> io::Result<(u16, u16)>;
}

/// The real controlling terminal, driven through crossterm
#[derive(Debug, Default, Clone, Copy)]
pub struct HostTerminal;

impl Terminal for HostTerminal {
    fn enable_raw_mode(&self) -> io::Result<()> {
        crossterm::terminal::enable_raw_mode()
    }

    fn disable_raw_mode(&self) -> io::Result<()> {
        crossterm::terminal::disable_raw_mode()
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        crossterm::terminal::size()
    }
}

/// Holds raw mode for its lifetime and restores the previous mode on drop
pub(crate) struct RawModeGuard<'a> {
    terminal: &'a dyn Terminal,
}

impl<'a> RawModeGuard<'a> {
    pub(crate) fn enter(terminal: &'a dyn Terminal) -> io::Result<Self> {
        terminal.enable_raw_mode()?;
        Ok(Self { terminal })
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.terminal.disable_raw_mode() {
            tracing::warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTerminal;

    #[test]
    fn test_guard_restores_on_drop() {
        let term = FakeTerminal::new();
        {
            let _guard = RawModeGuard::enter(&term).unwrap();
            assert!(term.is_raw());
        }
        assert!(!term.is_raw());
        assert_eq!(term.raw_entries(), 1);
    }

    #[test]
    fn test_guard_not_created_when_enable_fails() {
        let term = FakeTerminal::new().fail_raw_mode();
        assert!(RawModeGuard::enter(&term).is_err());
        assert!(!term.is_raw());
    }
}
