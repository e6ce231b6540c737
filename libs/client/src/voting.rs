//! Activity voting: optimistic local tallies reconciled against an
//! authoritative store whenever a peer's vote arrives over the relay.
//!
//! The relay only moves vote frames between members; it never counts them.
//! Counting lives behind [`TallySource`] so the store backing it (REST API,
//! database, fixture) is the integrator's choice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use waypoint_common::wire::{Body, Vote};
use waypoint_common::{MessageKind, VoteChoice};

use crate::transport::{RelayClient, Subscription};

/// Per-bucket vote totals for one activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteCounts {
    pub love: u32,
    pub maybe: u32,
    pub skip: u32,
}

impl VoteCounts {
    pub fn total(&self) -> u32 {
        self.love + self.maybe + self.skip
    }

    /// The bucket holding a strict majority, if any.
    ///
    /// A plurality is not enough: 3 love / 1 maybe is consensus, 2 love /
    /// 2 maybe is not.
    pub fn consensus(&self) -> Option<VoteChoice> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let max = self.love.max(self.maybe).max(self.skip);
        if 2 * max <= total {
            return None;
        }
        if self.love == max {
            Some(VoteChoice::Love)
        } else if self.maybe == max {
            Some(VoteChoice::Maybe)
        } else {
            Some(VoteChoice::Skip)
        }
    }

    fn bucket_mut(&mut self, choice: VoteChoice) -> &mut u32 {
        match choice {
            VoteChoice::Love => &mut self.love,
            VoteChoice::Maybe => &mut self.maybe,
            VoteChoice::Skip => &mut self.skip,
        }
    }
}

/// One activity's tally as the board currently sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteSummary {
    pub counts: VoteCounts,
    /// The local member's own vote, tracked locally and never overwritten by
    /// a refetch.
    pub user_vote: Option<VoteChoice>,
    pub consensus: Option<VoteChoice>,
}

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("tally lookup failed: {0}")]
    Lookup(String),
}

/// Authoritative vote counts for an activity, fetched out of band.
#[async_trait]
pub trait TallySource: Send + Sync {
    async fn vote_counts(&self, activity_id: &str) -> Result<VoteCounts, TallyError>;
}

struct BoardInner {
    client: RelayClient,
    member_id: String,
    member_name: Option<String>,
    source: Arc<dyn TallySource>,
    summaries: Mutex<HashMap<String, VoteSummary>>,
}

/// Vote tallies for the activities of one trip, for one local member.
pub struct VoteBoard {
    inner: Arc<BoardInner>,
    subscription: Subscription,
}

impl VoteBoard {
    pub fn new(
        client: &RelayClient,
        member_id: impl Into<String>,
        member_name: Option<String>,
        source: Arc<dyn TallySource>,
    ) -> Self {
        let inner = Arc::new(BoardInner {
            client: client.clone(),
            member_id: member_id.into(),
            member_name,
            source,
            summaries: Mutex::new(HashMap::new()),
        });

        let subscription = {
            let inner = inner.clone();
            client.on(MessageKind::Vote, move |envelope| {
                let Body::Vote(vote) = &envelope.body else {
                    return;
                };
                // Our own votes were applied optimistically on send; an echo
                // would double-count them.
                if vote.member_id == inner.member_id {
                    return;
                }
                let inner = inner.clone();
                let activity_id = vote.activity_id.clone();
                tokio::spawn(async move {
                    refetch(&inner, &activity_id).await;
                });
            })
        };

        Self {
            inner,
            subscription,
        }
    }

    /// Cast or change the local member's vote on an activity.
    ///
    /// The local tally moves immediately; the frame then goes out to peers.
    pub fn vote(&self, activity_id: &str, choice: VoteChoice) {
        {
            let mut summaries = self.inner.summaries.lock();
            let summary = summaries.entry(activity_id.to_string()).or_default();
            apply_local_vote(summary, choice);
        }
        self.inner.client.send(Body::Vote(Vote {
            activity_id: activity_id.to_string(),
            member_id: self.inner.member_id.clone(),
            vote_type: choice,
            member_name: self.inner.member_name.clone(),
        }));
    }

    /// Seed an activity's tally from the authoritative source if the board
    /// has not seen it yet.
    pub async fn prime(&self, activity_id: &str) -> Option<VoteSummary> {
        if let Some(existing) = self.summary(activity_id) {
            return Some(existing);
        }
        match self.inner.source.vote_counts(activity_id).await {
            Ok(counts) => {
                let summary = VoteSummary {
                    counts,
                    user_vote: None,
                    consensus: counts.consensus(),
                };
                self.inner
                    .summaries
                    .lock()
                    .entry(activity_id.to_string())
                    .or_insert(summary);
                Some(summary)
            }
            Err(err) => {
                warn!(activity_id, error = %err, "priming vote tally failed");
                None
            }
        }
    }

    pub fn summary(&self, activity_id: &str) -> Option<VoteSummary> {
        self.inner.summaries.lock().get(activity_id).copied()
    }

    pub fn user_vote(&self, activity_id: &str) -> Option<VoteChoice> {
        self.summary(activity_id).and_then(|s| s.user_vote)
    }

    /// Stop reacting to peer votes. Local state stays readable.
    pub fn stop(self) {
        self.subscription.unsubscribe();
    }
}

async fn refetch(inner: &Arc<BoardInner>, activity_id: &str) {
    match inner.source.vote_counts(activity_id).await {
        Ok(counts) => {
            let mut summaries = inner.summaries.lock();
            let summary = summaries.entry(activity_id.to_string()).or_default();
            summary.counts = counts;
            summary.consensus = counts.consensus();
        }
        Err(err) => {
            warn!(activity_id, error = %err, "refreshing vote tally failed");
        }
    }
}

fn apply_local_vote(summary: &mut VoteSummary, choice: VoteChoice) {
    if let Some(previous) = summary.user_vote {
        let bucket = summary.counts.bucket_mut(previous);
        *bucket = bucket.saturating_sub(1);
    }
    *summary.counts.bucket_mut(choice) += 1;
    summary.user_vote = Some(choice);
    summary.consensus = summary.counts.consensus();
}
