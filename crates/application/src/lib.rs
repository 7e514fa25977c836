//! 应用层实现。
//!
//! 实时同步管线的四个核心组件：凭据续期协调器、推送连接客户端、
//! 名单合并器、告警规则评估器，以及它们对外部适配器（传输、续期接口、
//! 会话终止、提示音、名单修改接口）的抽象。

pub mod alerts;
pub mod backoff;
pub mod clock;
pub mod credential;
pub mod error;
pub mod ports;
pub mod reconciler;
pub mod stream_client;

pub use alerts::{
    AlertEvaluator, AlertFired, AlertRunner, AlertRunnerDependencies, AlertSettings, AlertTasks,
    PersistedAlertState,
};
pub use backoff::{retry_async, Backoff, RetryConfig};
pub use clock::{Clock, SystemClock, TokioClock};
pub use credential::{CredentialCoordinator, CredentialEvent, RefreshPolicy};
pub use error::{
    MutationError, RefreshError, RenewalError, StoreError, StreamError, TransportError,
};
pub use ports::{
    AlertStateStore, ConnectRequest, FrameStream, RenewalScheme, RenewalTransport,
    RosterMutationGateway, SessionTerminator, SoundPlayer, StreamTransport,
};
pub use reconciler::{MutableField, Reconciler, ReconcilerSettings, ReconcilerTasks, RosterSnapshot};
pub use stream_client::{
    EnvironmentSignal, StreamClient, StreamClientConfig, StreamClientDependencies, StreamEvent,
};
