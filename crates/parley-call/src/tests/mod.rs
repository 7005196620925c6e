pub(crate) mod failing_writes;
pub(crate) mod fake_media;
pub(crate) mod muted_push;
