pub use crate::connection::{ConnectionId, ConnectionState, DisconnectReason};
pub use crate::driver::{Driver, SendBuffer};
pub use crate::endpoint::EndPoint;
pub use crate::events::EventKind;
pub use crate::ipc::IpcInterface;
pub use crate::params::Params;
pub use crate::pipeline::{PipelineId, PipelineStage, StageBuffer, StageCapacities, StageIo, StageRequests, NULL_PIPELINE};
pub use crate::shared::{ErrorType, ErrorUtils, NetworkError, NetworkResult, MTU};
pub use crate::stream::{CompressionModel, DataStream, Reader};
pub use crate::udp::UdpInterface;
