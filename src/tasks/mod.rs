mod bucket_cleanup;

pub use bucket_cleanup::BucketCleanupTask;
