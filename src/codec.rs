use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::{AlignedVec, Deserialize};

use crate::schedule::ScheduleState;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("data too short to contain version header")]
    TooShort,
    #[error("unsupported version: expected {expected}, found {found}")]
    UnsupportedVersion { expected: u8, found: u8 },
    #[error("rkyv error: {0}")]
    Rkyv(String),
}

// Bump when the ScheduleState layout changes and add migration in decode.
pub const SCHEDULE_STATE_VERSION: u8 = 1;

const VERSION_HEADER_SIZE: usize = 1;

fn prepend_version(version: u8, data: AlignedVec) -> Vec<u8> {
    let mut out = Vec::with_capacity(VERSION_HEADER_SIZE + data.len());
    out.push(version);
    out.extend_from_slice(&data);
    out
}

/// Validate and strip the version byte, copying the rest into an aligned buffer for rkyv.
fn strip_version(expected: u8, data: &[u8]) -> Result<AlignedVec, CodecError> {
    let (&found, rest) = data.split_first().ok_or(CodecError::TooShort)?;
    if found != expected {
        return Err(CodecError::UnsupportedVersion { expected, found });
    }
    let mut aligned = AlignedVec::with_capacity(rest.len());
    aligned.extend_from_slice(rest);
    Ok(aligned)
}

pub fn encode_schedule_state(state: &ScheduleState) -> Result<Vec<u8>, CodecError> {
    let data = rkyv::to_bytes::<ScheduleState, 256>(state)
        .map_err(|e| CodecError::Rkyv(e.to_string()))?;
    Ok(prepend_version(SCHEDULE_STATE_VERSION, data))
}

pub fn decode_schedule_state(bytes: &[u8]) -> Result<ScheduleState, CodecError> {
    let data = strip_version(SCHEDULE_STATE_VERSION, bytes)?;
    let archived = rkyv::check_archived_root::<ScheduleState>(&data)
        .map_err(|e| CodecError::Rkyv(e.to_string()))?;
    archived
        .deserialize(&mut SharedDeserializeMap::new())
        .map_err(|e| CodecError::Rkyv(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::LeaseState;

    #[test]
    fn leased_state_survives_encoding() {
        let state = ScheduleState::new(10_000, false)
            .granted(1_234, Some(LeaseState::grant("worker-a", 1_234, 30_000)));
        let bytes = encode_schedule_state(&state).unwrap();
        assert_eq!(bytes[0], SCHEDULE_STATE_VERSION);
        assert_eq!(decode_schedule_state(&bytes).unwrap(), state);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode_schedule_state(&ScheduleState::new(1, true)).unwrap();
        bytes[0] = 9;
        assert!(matches!(
            decode_schedule_state(&bytes),
            Err(CodecError::UnsupportedVersion { expected: 1, found: 9 })
        ));
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(matches!(decode_schedule_state(&[]), Err(CodecError::TooShort)));
        assert!(decode_schedule_state(&[SCHEDULE_STATE_VERSION, 1, 2, 3]).is_err());
    }
}
