pub mod audio;
pub mod buffer;
pub mod codec;
pub mod encoder;
pub mod error;
pub mod export;
pub mod mixer;
pub mod receiver;
pub mod registry;
pub mod storage;
pub mod transport;

pub use audio::AudioFormat;
pub use buffer::{BufferConfig, Chunk, ReplayBuffer, Rewind};
pub use codec::{DecoderFactory, FrameDecoder, OpusFrameDecoder, opus_decoder_factory};
pub use encoder::{TrackEncoder, WavTrackEncoder};
pub use error::{DecodeError, ExportError, TransportError};
pub use export::{ExportCoordinator, ExportKind, ExportWindow, TrackArtifact};
pub use mixer::{FfmpegMixer, NativeMixer, TrackMixer};
pub use receiver::SongbirdTransport;
pub use registry::{RegistryConfig, SessionRegistry, SpeakerFilter, SpeakerStatus, StoppedSession};
pub use storage::FileStorage;
pub use transport::{FrameReceiver, VoiceFrame, VoiceTransport};
