//! Session info text.
//!
//! The simulator keeps a YAML document in the region and bumps
//! `sessionInfoUpdate` after every rewrite. Reads copy the span between two
//! loads of that counter and retry if it moved or is negative (rewrite in
//! progress).

use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use super::buffer::ReadRetry;
use super::header::{DataFileHeader, offsets};
use crate::memory::SharedRegion;
use crate::{ConnectionError, Result};

/// A consistent copy of the session info document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionInfoText {
    /// Value of `sessionInfoUpdate` that bracketed the copy
    pub version: i32,
    pub text: String,
}

impl SessionInfoText {
    /// Read the session info from `region`.
    ///
    /// Fails instead of waiting when the region is frozen with a rewrite in
    /// progress.
    pub fn read(region: &dyn SharedRegion) -> Result<Self> {
        let mut retry = ReadRetry::new();
        let mut raw = Vec::new();

        loop {
            let header = DataFileHeader::read_validated(region)?;
            let version_before = header.session_info_version;
            if version_before < 0 {
                retry.rewriting(region, "session info", version_before)?;
                continue;
            }

            raw.resize(header.session_info_length.max(0) as usize, 0);
            region.copy_into(header.session_info_offset.max(0) as usize, &mut raw)?;

            let version_after = region.load_i32(offsets::SESSION_INFO_VERSION)?;
            if version_before == version_after {
                debug!(version = version_after, retries = retry.count(), bytes = raw.len(), "Read session info");
                return Ok(Self { version: version_after, text: decode_latin1(&raw) });
            }

            trace!(version_before, version_after, retries = retry.count() + 1, "Session info changed during read, retrying");
            retry.torn();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Deserialize the document after cleaning it with [`preprocess_yaml`].
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        let cleaned = preprocess_yaml(&self.text)?;
        serde_yaml_ng::from_str(&cleaned)
            .map_err(|e| ConnectionError::parse_error("Session info YAML", e.to_string()))
    }
}

/// Decode Latin-1 bytes up to the first NUL.
pub fn decode_latin1(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end].iter().map(|&b| b as char).collect()
}

/// Encode text as Latin-1, replacing characters outside the range with `?`.
pub fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars().map(|ch| if (ch as u32) < 0x100 { ch as u8 } else { b'?' }).collect()
}

/// Strip the control characters the simulator occasionally leaves in its
/// YAML (everything below 0x20 except tab, newline and carriage return).
pub fn preprocess_yaml(yaml: &str) -> Result<String> {
    let cleaned: String = yaml
        .chars()
        .filter(|ch| !matches!(ch, '\x00'..='\x08' | '\x0B'..='\x0C' | '\x0E'..='\x1F'))
        .collect();

    if cleaned.trim().is_empty() {
        return Err(ConnectionError::parse_error(
            "YAML preprocessing",
            "YAML is empty after preprocessing",
        ));
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySnapshot;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct WeekendInfo {
        track_name: String,
        #[serde(rename = "TrackID")]
        track_id: i32,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct Session {
        weekend_info: WeekendInfo,
    }

    #[test]
    fn latin1_round_trips_and_stops_at_nul() {
        let bytes = encode_latin1("Nürburgring");
        assert_eq!(bytes.len(), 11);
        let mut padded = bytes.clone();
        padded.extend_from_slice(&[0, b'x', b'y']);
        assert_eq!(decode_latin1(&padded), "Nürburgring");
        assert_eq!(encode_latin1("日"), vec![b'?']);
    }

    #[test]
    fn preprocess_removes_control_characters() {
        let cleaned = preprocess_yaml("WeekendInfo:\n\x00\x01  TrackName: test\x03\r\n\t").unwrap();
        assert!(!cleaned.contains('\x00'));
        assert!(!cleaned.contains('\x03'));
        assert!(cleaned.contains('\t') && cleaned.contains('\r'));
        assert!(preprocess_yaml("\x01\x02 \n").is_err());
    }

    #[test]
    fn frozen_mid_rewrite_session_fails_instead_of_spinning() {
        let simulator = crate::test_utils::sample_simulator().unwrap();
        let mut bytes = vec![0u8; simulator.memory().len()];
        simulator.memory().copy_into(0, &mut bytes).unwrap();
        bytes[offsets::SESSION_INFO_VERSION..offsets::SESSION_INFO_VERSION + 4]
            .copy_from_slice(&(-1i32).to_le_bytes());
        let frozen = MemorySnapshot::from(bytes);

        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = sender.send(SessionInfoText::read(&frozen));
        });
        let result = receiver.recv_timeout(std::time::Duration::from_secs(2)).expect("read returned");
        assert!(matches!(result, Err(ConnectionError::Parse { .. })), "{:?}", result);
    }

    #[test]
    fn typed_parse() {
        let info = SessionInfoText {
            version: 1,
            text: "---\nWeekendInfo:\n TrackName: spa\x02\n TrackID: 163\n...\n".to_string(),
        };
        let session: Session = info.parse().unwrap();
        assert_eq!(session.weekend_info.track_name, "spa");
        assert_eq!(session.weekend_info.track_id, 163);

        let broken = SessionInfoText { version: 1, text: "WeekendInfo: [".to_string() };
        assert!(matches!(broken.parse::<Session>(), Err(ConnectionError::Parse { .. })));
    }
}
