//! Domain vocabulary shared by the storage layer and the HTTP application.

pub mod access;
pub mod device;
pub mod paging;
pub mod types;

pub use access::{require_role, require_self_or, AccessError};
pub use device::{device_label, is_deliverable_device_token, UNKNOWN_DEVICE, UNKNOWN_IP};
pub use paging::Page;
pub use types::{
    DraftError, HomeworkStatus, NotificationDraft, NotificationStatus, NotificationType, Role,
    UnknownVariant,
};
