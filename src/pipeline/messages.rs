//! Message types passed between the per-connection pipeline stages.

/// One punctuation-bounded slice of an assistant reply, queued for synthesis.
///
/// Indices are assigned by the response streamer and are strictly increasing
/// within a turn, starting at 1.
#[derive(Debug, Clone)]
pub struct SynthesisJob {
    /// Cleaned segment text.
    pub text: String,
    /// Position of this segment within the turn.
    pub index: i64,
}

/// Synthesized audio for one segment, ready for paced delivery.
///
/// Produced by the pool slot after MP3 decode and opus framing. A failed
/// synthesis still yields a delivery with no frames so the sink can keep its
/// bracketing messages and stop bookkeeping consistent.
#[derive(Debug, Clone)]
pub struct AudioDelivery {
    /// Downlink opus frames (60 ms each). Empty when synthesis failed.
    pub frames: Vec<Vec<u8>>,
    /// Segment text echoed in the `sentence_start` marker.
    pub text: Option<String>,
    /// Segment position within the turn.
    pub index: i64,
}

/// A frame bound for the client socket. All writers funnel through one
/// outbound channel so control messages and audio interleave on a single
/// sink task.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// JSON control message, already encoded.
    Control(String),
    /// One opus frame.
    Audio(Vec<u8>),
    /// Close the client socket after everything queued so far has flushed.
    Close,
}
