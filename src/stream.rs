use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

pub const BROADCAST_CAPACITY: usize = 64;

/// Capacity for the input channel feeding a connection's writer task. Each
/// message is a small chunk of user input, so back-pressure kicks in long
/// before memory matters.
const INPUT_CHANNEL_CAPACITY: usize = 256;

/// Per-connection byte broker: fans connection output out to any number of
/// subscribers and funnels input from any number of producers into the
/// single writer task.
///
/// Output is a live stream. Subscribers that attach late miss earlier bytes,
/// and slow subscribers observe `Lagged` rather than stalling the reader.
#[derive(Clone, Debug)]
pub struct ByteBroker {
    output_tx: broadcast::Sender<Bytes>,
    input_tx: mpsc::Sender<Bytes>,
}

impl ByteBroker {
    /// Create a broker, returning it together with the receiving half of the
    /// input channel for the connection's writer task.
    pub fn new() -> (Self, mpsc::Receiver<Bytes>) {
        let (output_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        (
            Self {
                output_tx,
                input_tx,
            },
            input_rx,
        )
    }

    pub fn publish(&self, data: Bytes) {
        // Ignore error - means no receivers
        let _ = self.output_tx.send(data);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    pub fn input(&self) -> mpsc::Sender<Bytes> {
        self.input_tx.clone()
    }
}
