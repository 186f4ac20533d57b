//! The domain plugin wire protocol.
//!
//! Domains run out of process; the channel carries typed
//! request/response pairs as length-prefixed JSON frames (a 4-byte
//! big-endian length, then the JSON body). During a request the plugin
//! may issue *callback* requests back into the core — state queries and
//! codec helpers — on the same channel, correlated by id.
//!
//! The channel is expected to be lossy and restartable: every request
//! here is safe to resend, which is why ids travel with the frames and
//! why the four-phase contract keeps Assemble idempotent.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::filters::Query;
use crate::states::store::ReceivedState;
use crate::types::{LedgerAddress, LedgerEvent, SchemaId, StateId};

use super::{
    AssembleResult, DeploySpec, DomainCapabilities, EndorseOutcome, EndorseRequest, EventHandling,
    PrepareInput, PrepareResult, PreparedDeploy, PrivateTxSpec, ResolvedVerifier, TransactionStates,
    VerifierRequest,
};

// ---------------------------------------------------------------------------
// Requests & responses
// ---------------------------------------------------------------------------

/// Core → plugin requests, one per contract phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainRequest {
    Configure {
        config: Value,
    },
    InitContract {
        address: LedgerAddress,
        config: Value,
    },
    InitDeploy {
        deploy: DeploySpec,
    },
    PrepareDeploy {
        deploy: DeploySpec,
        verifiers: Vec<ResolvedVerifier>,
    },
    InitTransaction {
        transaction: PrivateTxSpec,
    },
    AssembleTransaction {
        transaction: PrivateTxSpec,
        verifiers: Vec<ResolvedVerifier>,
        /// The context the plugin's state-query callbacks run against.
        context: Uuid,
    },
    EndorseTransaction {
        request: Box<EndorseRequest>,
        context: Uuid,
    },
    PrepareTransaction {
        transaction: PrivateTxSpec,
        input: PrepareInput,
    },
    InitCall {
        transaction: PrivateTxSpec,
    },
    ExecCall {
        transaction: PrivateTxSpec,
        verifiers: Vec<ResolvedVerifier>,
        context: Uuid,
    },
    BuildReceipt {
        transaction: Uuid,
        states: TransactionStates,
    },
    ValidateStateHashes {
        states: Vec<ReceivedState>,
    },
    HandleEventBatch {
        events: Vec<LedgerEvent>,
    },
}

/// Plugin → core responses, mirroring [`DomainRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainResponse {
    Configure { capabilities: DomainCapabilities },
    InitContract { config: Value },
    InitDeploy { verifiers: Vec<VerifierRequest> },
    PrepareDeploy { prepared: PreparedDeploy },
    InitTransaction { verifiers: Vec<VerifierRequest> },
    AssembleTransaction { result: AssembleResult },
    EndorseTransaction { outcome: EndorseOutcome },
    PrepareTransaction { result: PrepareResult },
    InitCall { verifiers: Vec<VerifierRequest> },
    ExecCall { result: Value },
    BuildReceipt { receipt: Value },
    ValidateStateHashes { ids: Vec<StateId> },
    HandleEventBatch { handling: EventHandling },
    /// Any phase may fail; `permanent` distinguishes domain-permanent
    /// failures from retryable plugin trouble.
    Error { message: String, permanent: bool },
}

/// Plugin → core callback requests issued mid-phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallbackRequest {
    FindAvailableStates {
        context: Uuid,
        schema: SchemaId,
        query: Query,
    },
    FindAvailableNullifiers {
        context: Uuid,
        schema: SchemaId,
        query: Query,
    },
    EncodeData {
        encoding: String,
        data: Value,
    },
    DecodeData {
        encoding: String,
        bytes: Vec<u8>,
    },
    RecoverSigner {
        algorithm: String,
        payload: Vec<u8>,
        signature: Vec<u8>,
    },
}

/// Core → plugin callback responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallbackResponse {
    States { states: Vec<super::EndorsableState> },
    Encoded { bytes: Vec<u8> },
    Decoded { data: Value },
    Signer { verifier: String },
    Error { message: String },
}

/// One frame on the plugin channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: Uuid,
        body: DomainRequest,
    },
    Response {
        /// Echoes the request id.
        id: Uuid,
        body: DomainResponse,
    },
    Callback {
        id: Uuid,
        /// The in-flight request this callback belongs to.
        request: Uuid,
        body: CallbackRequest,
    },
    CallbackResponse {
        id: Uuid,
        body: CallbackResponse,
    },
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Frames larger than this are rejected rather than buffered.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    TooLarge(u32),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    let body = serde_json::to_vec(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
    let len = body.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| FrameError::Malformed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::Request {
            id: Uuid::new_v4(),
            body: DomainRequest::Configure {
                config: json!({"notary": "alice"}),
            },
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame).unwrap();
        // 4-byte length prefix then JSON.
        assert_eq!(
            u32::from_be_bytes(buffer[..4].try_into().unwrap()) as usize,
            buffer.len() - 4
        );

        let mut cursor = std::io::Cursor::new(buffer);
        let back = read_frame(&mut cursor).unwrap();
        assert!(matches!(
            back,
            Frame::Request {
                body: DomainRequest::Configure { .. },
                ..
            }
        ));
    }

    #[test]
    fn multiple_frames_stream() {
        let mut buffer = Vec::new();
        for i in 0..3u32 {
            let frame = Frame::Callback {
                id: Uuid::new_v4(),
                request: Uuid::new_v4(),
                body: CallbackRequest::EncodeData {
                    encoding: format!("enc-{}", i),
                    data: json!(i),
                },
            };
            write_frame(&mut buffer, &frame).unwrap();
        }

        let mut cursor = std::io::Cursor::new(buffer);
        for i in 0..3u32 {
            match read_frame(&mut cursor).unwrap() {
                Frame::Callback {
                    body: CallbackRequest::EncodeData { encoding, .. },
                    ..
                } => assert_eq!(encoding, format!("enc-{}", i)),
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[test]
    fn truncated_frame_is_io_error() {
        let frame = Frame::Response {
            id: Uuid::new_v4(),
            body: DomainResponse::Error {
                message: "boom".to_string(),
                permanent: true,
            },
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame).unwrap();
        buffer.truncate(buffer.len() - 2);

        let mut cursor = std::io::Cursor::new(buffer);
        assert!(matches!(read_frame(&mut cursor), Err(FrameError::Io(_))));
    }

    #[test]
    fn oversized_frame_rejected_on_read() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buffer);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FrameError::TooLarge(_))
        ));
    }
}
