//! State bits of a playback source.

use crate::backend::VoiceState;

/// Orthogonal state flags of a source.
///
/// `playing` and `paused` together encode the transport state:
///
/// | playing | paused | state   |
/// |---------|--------|---------|
/// | false   | -      | Stopped |
/// | true    | false  | Playing |
/// | true    | true   | Paused (armed, not advancing) |
///
/// The other flags are independent modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceFlags {
    /// Started and not stopped since.
    pub playing: bool,
    /// Holding position while armed.
    pub paused: bool,
    /// A static buffer loops instead of completing.
    pub repeat: bool,
    /// A transport change was requested and the backend has not confirmed it.
    pub changing: bool,
    /// Freed by its owner; torn down once the backend has stopped.
    pub closing: bool,
    /// The user handle was dropped; torn down once the backend has stopped.
    pub orphan: bool,
}

impl SourceFlags {
    /// Returns `true` while playing and not paused.
    pub fn is_playing(&self) -> bool {
        self.playing && !self.paused
    }

    /// Returns `true` while armed but paused.
    pub fn is_paused(&self) -> bool {
        self.playing && self.paused
    }

    /// Returns `true` once the source is being torn down.
    pub fn is_releasing(&self) -> bool {
        self.closing || self.orphan
    }

    /// The backend state that confirms the current transport request.
    pub(crate) fn target(&self) -> VoiceState {
        match (self.playing, self.paused) {
            (false, _) => VoiceState::Stopped,
            (true, false) => VoiceState::Playing,
            (true, true) => VoiceState::Paused,
        }
    }
}

/// How a source receives its data. Decided by the first buffer attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceMode {
    /// No buffer attached yet.
    #[default]
    Undetermined,
    /// Exactly one buffer, replayed or paused on completion.
    Static,
    /// A FIFO of buffers, each consumed once.
    Stream,
}

/// Unit of a seek position passed to
/// [`Source::set_buffer_offset`](crate::Source::set_buffer_offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetUnit {
    /// Blocks (frames) of the source format.
    Blocks,
    /// Milliseconds.
    Millis,
    /// Bytes of the source format, truncated to whole blocks.
    Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_states() {
        let mut flags = SourceFlags::default();
        assert!(!flags.is_playing());
        assert_eq!(flags.target(), VoiceState::Stopped);

        flags.playing = true;
        assert!(flags.is_playing());
        assert_eq!(flags.target(), VoiceState::Playing);

        flags.paused = true;
        assert!(flags.is_paused());
        assert!(!flags.is_playing());
        assert_eq!(flags.target(), VoiceState::Paused);
    }

    #[test]
    fn test_paused_without_playing_is_stopped() {
        let flags = SourceFlags {
            paused: true,
            ..Default::default()
        };
        assert!(!flags.is_paused());
        assert_eq!(flags.target(), VoiceState::Stopped);
    }

    #[test]
    fn test_releasing() {
        let flags = SourceFlags {
            orphan: true,
            ..Default::default()
        };
        assert!(flags.is_releasing());
    }
}
