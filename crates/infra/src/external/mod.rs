//! Outbound collaborators: the inference provider, object storage and the
//! title generator. Each has an HTTP client and an in-process stand-in.

pub mod provider;
pub mod storage;
pub mod titles;

pub use provider::{CreatedJob, HttpJobProvider, JobProvider, ProviderError, StubJobProvider};
pub use storage::{
    HttpObjectStorage, InMemoryObjectStorage, ObjectStorage, StorageError, StoredObject,
};
pub use titles::{
    FixedTitleGenerator, NoopTitleGenerator, OpenAiTitleGenerator, TitleError, TitleGenerator,
};

use std::time::Duration;

/// Timeout for every outbound request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("artforge/", env!("CARGO_PKG_VERSION")))
        .build()
}

pub(crate) fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
