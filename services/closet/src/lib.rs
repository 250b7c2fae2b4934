//! CLST Closet Service
//!
//! Item lifecycle for the digital closet: photos go to object storage under
//! deterministic, owner-scoped keys, and the item record keeps only those
//! keys. Displayable URLs are signed on every read and never stored.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────┐
//!  Auth Gate ─────▶│ Closet       │──────────────────┐
//!  (owner id)      │ Service      │                  │
//!                  └──────────────┘                  │
//!                    │         │                     ▼
//!                    ▼         ▼              ┌──────────────┐
//!           ┌──────────────┐ ┌──────────────┐ │ Item         │
//!           │ Upload       │ │ URL          │ │ Repository   │
//!           │ Pipeline     │ │ Resolver     │ │ (PostgreSQL) │
//!           └──────────────┘ └──────────────┘ └──────────────┘
//!                    │         │                     ▲
//!                    ▼         ▼                     │
//!                  ┌──────────────┐           ┌──────────────┐
//!                  │ Object Store │◀──────────│ Orphan       │
//!                  │ (S3)         │           │ Sweeper      │
//!                  └──────────────┘           └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod keys;
pub mod model;
pub mod object_store;
pub mod repository;
pub mod resolver;
pub mod service;
pub mod sweep;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{AuthError, ClosetError, DataError, StoreError, ValidationErrors};
pub use identity::{AuthGate, AuthState, CognitoIdentity, CurrentUser, IdentityService};
pub use keys::{AssetPurpose, KeyNamer, ObjectKey};
pub use model::{Category, ClosetItem, ItemDetails, ItemForm, ItemId, ItemQuery, OwnerId, PhotoLimits};
pub use object_store::{ObjectStore, S3ObjectStore, SignedUrl};
pub use repository::{ItemRepository, PgItemRepository};
pub use resolver::{PhotoSlot, UrlResolver};
pub use service::{ClosetService, CreateHandle, DeleteOutcome, HydratedItem};
pub use sweep::{OrphanSweeper, SweepReport};
pub use upload::{PhotoFile, UploadPipeline};
