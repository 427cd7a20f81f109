//! Upload of queued changes
//!
//! Entries go out in tiers so the server always sees a parent before its
//! children and a child's removal before its parent's: adds and updates by
//! hierarchy depth, root first, then deletes by depth, leaf first. Entries
//! within a tier belong to different entities and are pushed concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::pending::{ChangeAction, PendingChange, PendingQueue};
use crate::remote::{RemoteApi, RemoteError};
use crate::storage::StorageResult;

/// A change the server refused; it has been removed from the queue
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub change: PendingChange,
    pub status: u16,
    pub message: String,
}

impl Rejection {
    pub fn to_error(&self) -> SyncError {
        SyncError::ServerRejected {
            kind: self.change.kind,
            target: self.change.target.clone(),
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    pub confirmed: usize,
    /// Still queued, for the next flush
    pub retained: usize,
    pub rejected: Vec<Rejection>,
    /// The server refused the session; nothing further was sent
    pub unauthorized: bool,
}

impl UploadReport {
    pub fn is_clean(&self) -> bool {
        self.retained == 0 && self.rejected.is_empty()
    }
}

/// Order key: adds and updates root-first, then deletes leaf-first
fn tier(change: &PendingChange) -> (u8, usize) {
    let depth = change.kind.depth();
    match change.action {
        ChangeAction::Add | ChangeAction::Update => (0, depth),
        ChangeAction::Delete => (1, usize::MAX - depth),
    }
}

pub struct Uploader {
    queue: PendingQueue,
    remote: Arc<dyn RemoteApi>,
    concurrency: usize,
}

impl Uploader {
    pub fn new(queue: PendingQueue, remote: Arc<dyn RemoteApi>, concurrency: usize) -> Self {
        Self {
            queue,
            remote,
            concurrency: concurrency.max(1),
        }
    }

    /// Push every queued change once
    ///
    /// Transport failures keep the entry and stop later tiers, since they
    /// may depend on it. Rejected entries are dropped and reported.
    pub async fn flush(&self) -> StorageResult<UploadReport> {
        let entries = self.queue.begin_upload()?;
        let mut report = UploadReport::default();
        if entries.is_empty() {
            return Ok(report);
        }
        debug!("Uploading {} pending change(s)", entries.len());

        let mut tiers: BTreeMap<(u8, usize), Vec<PendingChange>> = BTreeMap::new();
        for change in entries {
            tiers.entry(tier(&change)).or_default().push(change);
        }

        let semaphore = Semaphore::new(self.concurrency);
        let mut tiers = tiers.into_values();
        while let Some(batch) = tiers.next() {
            let semaphore = &semaphore;
            let remote = &self.remote;
            let results = join_all(batch.into_iter().map(|change| async move {
                let _permit = semaphore.acquire().await.ok();
                let result = remote.push(&change).await;
                (change, result)
            }))
            .await;

            let mut blocked = false;
            for (change, result) in results {
                match result {
                    Ok(()) => {
                        if self.queue.confirm(&change)? {
                            report.confirmed += 1;
                        } else if self.queue.find(change.kind, &change.target)?.is_some() {
                            // Edited again during the upload; the newer intent goes next time
                            report.retained += 1;
                        }
                    }
                    Err(RemoteError::Rejected { status, message }) => {
                        warn!(
                            "Server rejected {} {} '{}': {}",
                            change.action, change.kind, change.target, message
                        );
                        self.queue.discard(&change.id)?;
                        report.rejected.push(Rejection {
                            change,
                            status,
                            message,
                        });
                    }
                    Err(e) => {
                        debug!("Keeping {} '{}' queued: {}", change.kind, change.target, e);
                        if matches!(e, RemoteError::Unauthorized) {
                            report.unauthorized = true;
                        }
                        report.retained += 1;
                        blocked = true;
                    }
                }
            }

            if blocked {
                report.retained += tiers.by_ref().map(|batch| batch.len()).sum::<usize>();
                break;
            }
        }

        info!(
            "Upload finished: {} confirmed, {} retained, {} rejected",
            report.confirmed,
            report.retained,
            report.rejected.len()
        );
        Ok(report)
    }
}
