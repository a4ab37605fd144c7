//! Core state management for the herald messaging client: accounts and
//! their identity keys, per-peer-device ratchet sessions, group state
//! reconciliation, the message pipeline, and multi-device sync.
//!
//! Cryptographic primitives live behind [`crypto::CryptoEngine`]; network
//! transport behind [`transport::Transport`]. Everything else (who we are,
//! who we talk to, and what state that conversation is in) is here.

pub mod account;
pub mod crypto;
pub mod error;
pub mod file_storage;
pub mod group;
pub mod group_store;
pub mod identity;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod session_store;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

pub use account::{Account, AccountManifest};
pub use crypto::{
    ChainKdfEngine, CryptoEngine, FrameHeader, MessageFrame, RatchetState, SessionInit,
};
pub use error::{Error, Result};
pub use file_storage::FileStorageAdapter;
pub use group::{GroupDelta, GroupState, Member, MemberRole, MemberStatus};
pub use group_store::{GroupStateStore, UpdateOutcome};
pub use identity::{
    IdentityKeyPair, IdentityKeyStore, PreKeyBundle, PreKeyRecord, SignedPreKeyRecord,
    TrustDecision,
};
pub use pipeline::{
    BatchSummary, DeliveryReport, DeliveryStatus, InboundEvent, MessagePipeline, Payload,
    PipelineConfig, SendReport,
};
pub use registry::{AccountRegistry, FailureReason, FlowState, ProvisioningRequest};
pub use session::PeerSession;
pub use session_store::SessionStore;
pub use storage::{InMemoryStorage, StorageAdapter};
pub use sync::{SyncChange, SyncCoordinator, SyncRecord};
pub use transport::{
    Envelope, InMemoryDirectory, InMemoryTransport, PeerDirectory, SendOutcome, Transport,
};
pub use types::{Address, LinkedDevice, RegistrationState};
