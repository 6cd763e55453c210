#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("messenger '{0}' is already loaded")]
    DuplicateMessenger(String),

    #[error("unknown messenger {messenger} on campaign {campaign}")]
    UnknownMessenger { messenger: String, campaign: String },

    #[error("error compiling template: {0}")]
    Compile(#[source] minijinja::Error),

    #[error("error rendering template: {0}")]
    Render(#[source] minijinja::Error),

    #[error("error loading attachment {media_id}: {source}")]
    Attachment {
        media_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("template {0} not found")]
    TemplateNotFound(i64),

    #[error("message push timed out")]
    PushTimeout,

    #[error("message queue is closed")]
    QueueClosed,

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("render task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
