//! REST collaborator: conversation listing and file uploads

mod client;

pub use client::{ApiClient, ApiError, ConversationSummary, UploadedFile};
