use super::error::PendingAcknowledgement;
use crate::domain::{ConsumerDescription, ConsumerIdentifier, Format, GroupIdentifier};
use crate::library::communication::BlackboxError;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Violation of the publication order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationViolation {
    GroupClosed,
    UnknownGroup,
    PublicationComplete,
}

#[derive(Debug, Default)]
struct GroupState {
    closed: bool,
    message_count: u64,
}

#[derive(Debug)]
struct SubscriberState {
    description: ConsumerDescription,
    failure: Option<BlackboxError>,
    last_seen: Instant,
}

/// Where the evaluation stands from the publisher's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Groups may still be opened
    Publishing,
    /// Waiting for acknowledgements
    Pending(Vec<PendingAcknowledgement>),
    /// Every subscriber acknowledged every group
    Consumed,
    /// A subscriber failed irrecoverably
    Failed {
        consumer_id: ConsumerIdentifier,
        error: BlackboxError,
    },
}

/// Completion bookkeeping of one evaluation
///
/// Total completion requires that publication has been declared complete and that every
/// group is closed and acknowledged by every registered subscriber.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    groups: BTreeMap<GroupIdentifier, GroupState>,
    publication_complete: bool,
    subscribers: BTreeMap<ConsumerIdentifier, SubscriberState>,
    acknowledged: BTreeSet<(GroupIdentifier, ConsumerIdentifier)>,
    paths: BTreeSet<PathBuf>,
    message_count: u64,
}

impl CompletionTracker {
    /// Accounts for a new message and returns its sequence number within the evaluation
    pub fn record_message(&mut self, group_id: &str) -> Result<u64, PublicationViolation> {
        if self.publication_complete {
            return Err(PublicationViolation::PublicationComplete);
        }

        let group = self.groups.entry(group_id.to_owned()).or_default();

        if group.closed {
            return Err(PublicationViolation::GroupClosed);
        }

        group.message_count += 1;
        self.message_count += 1;

        Ok(self.message_count)
    }

    /// Closes a group and returns its message count, `None` if it was closed before
    pub fn close_group(&mut self, group_id: &str) -> Result<Option<u64>, PublicationViolation> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or(PublicationViolation::UnknownGroup)?;

        if group.closed {
            return Ok(None);
        }

        group.closed = true;
        Ok(Some(group.message_count))
    }

    /// Declares publication complete and closes remaining groups
    ///
    /// Returns the groups closed implicitly with their message counts, or `None` when publication
    /// had already been completed before.
    pub fn complete_publication(&mut self) -> Option<Vec<(GroupIdentifier, u64)>> {
        if self.publication_complete {
            return None;
        }

        self.publication_complete = true;

        Some(
            self.groups
                .iter_mut()
                .filter(|(_, group)| !group.closed)
                .map(|(id, group)| {
                    group.closed = true;
                    (id.clone(), group.message_count)
                })
                .collect(),
        )
    }

    pub fn is_publication_complete(&self) -> bool {
        self.publication_complete
    }

    pub fn group_count(&self) -> u64 {
        self.groups.len() as u64
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Registers a subscriber, returns false if it was known already
    pub fn register(&mut self, description: ConsumerDescription) -> bool {
        if self.subscribers.contains_key(&description.consumer_id) {
            return false;
        }

        self.subscribers.insert(
            description.consumer_id.clone(),
            SubscriberState {
                description,
                failure: None,
                last_seen: Instant::now(),
            },
        );

        true
    }

    pub fn is_registered(&self, consumer_id: &str) -> bool {
        self.subscribers.contains_key(consumer_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Records that a subscriber has been heard of, returns false for unknown subscribers
    pub fn touch(&mut self, consumer_id: &str, now: Instant) -> bool {
        match self.subscribers.get_mut(consumer_id) {
            Some(subscriber) => {
                subscriber.last_seen = subscriber.last_seen.max(now);
                true
            }
            None => false,
        }
    }

    /// First subscriber with outstanding work that has been silent for longer than `limit`
    ///
    /// Subscribers which failed or acknowledged every group of a completed publication are never
    /// considered unresponsive.
    pub fn unresponsive(&self, now: Instant, limit: Duration) -> Option<(ConsumerIdentifier, Duration)> {
        self.subscribers
            .iter()
            .filter(|(_, subscriber)| subscriber.failure.is_none())
            .filter(|(consumer_id, _)| !self.is_done(consumer_id))
            .map(|(consumer_id, subscriber)| {
                (consumer_id, now.saturating_duration_since(subscriber.last_seen))
            })
            .find(|(_, silence)| *silence > limit)
            .map(|(consumer_id, silence)| (consumer_id.clone(), silence))
    }

    fn is_done(&self, consumer_id: &str) -> bool {
        self.publication_complete
            && self.groups.keys().all(|group_id| {
                self.acknowledged
                    .contains(&(group_id.clone(), consumer_id.to_owned()))
            })
    }

    /// Records consumption of a group, returns false for unknown subscribers or groups
    pub fn acknowledge(
        &mut self,
        consumer_id: &str,
        group_id: &str,
        paths: BTreeSet<PathBuf>,
    ) -> bool {
        if !self.subscribers.contains_key(consumer_id) || !self.groups.contains_key(group_id) {
            return false;
        }

        self.acknowledged
            .insert((group_id.to_owned(), consumer_id.to_owned()));
        self.paths.extend(paths);

        true
    }

    /// Marks a subscriber as failed, returns false for unknown subscribers
    pub fn fail(&mut self, consumer_id: &str, error: BlackboxError) -> bool {
        match self.subscribers.get_mut(consumer_id) {
            Some(subscriber) => {
                subscriber.failure.get_or_insert(error);
                true
            }
            None => false,
        }
    }

    /// Formats offered by subscribers that have not failed
    pub fn offered_formats(&self) -> BTreeSet<Format> {
        self.subscribers
            .values()
            .filter(|subscriber| subscriber.failure.is_none())
            .flat_map(|subscriber| subscriber.description.formats.iter().copied())
            .collect()
    }

    /// Union of all artifacts reported so far
    pub fn paths(&self) -> &BTreeSet<PathBuf> {
        &self.paths
    }

    /// Acknowledgements that are still outstanding
    pub fn pending(&self) -> Vec<PendingAcknowledgement> {
        let mut pending = Vec::new();

        for group_id in self.groups.keys() {
            for (consumer_id, subscriber) in &self.subscribers {
                let key = (group_id.clone(), consumer_id.clone());

                if subscriber.failure.is_none() && !self.acknowledged.contains(&key) {
                    pending.push(PendingAcknowledgement {
                        group_id: group_id.clone(),
                        consumer_id: consumer_id.clone(),
                    });
                }
            }
        }

        pending
    }

    pub fn progress(&self) -> Progress {
        let failure = self.subscribers.iter().find_map(|(id, subscriber)| {
            subscriber
                .failure
                .as_ref()
                .map(|error| (id.clone(), error.clone()))
        });

        if let Some((consumer_id, error)) = failure {
            return Progress::Failed { consumer_id, error };
        }

        if !self.publication_complete {
            return Progress::Publishing;
        }

        let pending = self.pending();

        if pending.is_empty() {
            Progress::Consumed
        } else {
            Progress::Pending(pending)
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    fn subscriber(id: &str) -> ConsumerDescription {
        ConsumerDescription {
            consumer_id: id.into(),
            formats: vec![Format::Csv].into_iter().collect(),
        }
    }

    fn paths(names: &[&str]) -> BTreeSet<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn detect_silent_subscribers_with_outstanding_work() {
        let mut tracker = CompletionTracker::default();
        tracker.register(subscriber("csv-1"));
        tracker.register(subscriber("csv-2"));
        tracker.record_message("a").unwrap();

        let start = Instant::now();
        let limit = Duration::from_secs(60);

        assert!(tracker.touch("csv-1", start + Duration::from_secs(100)));
        assert!(!tracker.touch("png-1", start));

        assert_eq!(tracker.unresponsive(start + Duration::from_secs(30), limit), None);
        assert_eq!(
            tracker
                .unresponsive(start + Duration::from_secs(120), limit)
                .map(|(consumer_id, _)| consumer_id),
            Some("csv-2".to_owned())
        );
    }

    #[test]
    fn forget_silence_of_finished_or_failed_subscribers() {
        let mut tracker = CompletionTracker::default();
        tracker.register(subscriber("csv-1"));
        tracker.register(subscriber("csv-2"));
        tracker.record_message("a").unwrap();
        tracker.complete_publication();

        tracker.acknowledge("csv-1", "a", paths(&["a.csv"]));
        tracker.fail("csv-2", BlackboxError::from_message("disk full"));

        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(tracker.unresponsive(later, Duration::from_secs(60)), None);
    }

    #[test]
    fn number_messages_across_groups() {
        let mut tracker = CompletionTracker::default();

        assert_eq!(tracker.record_message("a"), Ok(1));
        assert_eq!(tracker.record_message("b"), Ok(2));
        assert_eq!(tracker.record_message("a"), Ok(3));
        assert_eq!(tracker.group_count(), 2);
    }

    #[test]
    fn close_groups_idempotently() {
        let mut tracker = CompletionTracker::default();
        tracker.record_message("a").unwrap();
        tracker.record_message("a").unwrap();

        assert_eq!(tracker.close_group("a"), Ok(Some(2)));
        assert_eq!(tracker.close_group("a"), Ok(None));
        assert_eq!(
            tracker.record_message("a"),
            Err(PublicationViolation::GroupClosed)
        );
        assert_eq!(
            tracker.close_group("b"),
            Err(PublicationViolation::UnknownGroup)
        );
    }

    #[test]
    fn close_remaining_groups_on_completion() {
        let mut tracker = CompletionTracker::default();
        tracker.record_message("a").unwrap();
        tracker.record_message("b").unwrap();
        tracker.close_group("a").unwrap();

        assert_eq!(
            tracker.complete_publication(),
            Some(vec![("b".to_owned(), 1)])
        );
        assert_eq!(tracker.complete_publication(), None);
        assert_eq!(
            tracker.record_message("c"),
            Err(PublicationViolation::PublicationComplete)
        );
    }

    #[test]
    fn complete_without_subscribers() {
        let mut tracker = CompletionTracker::default();
        tracker.record_message("a").unwrap();

        assert_eq!(tracker.progress(), Progress::Publishing);

        tracker.complete_publication();
        assert_eq!(tracker.progress(), Progress::Consumed);
        assert!(tracker.paths().is_empty());
    }

    #[test]
    fn wait_for_every_subscriber_and_group() {
        let mut tracker = CompletionTracker::default();
        tracker.record_message("a").unwrap();
        tracker.record_message("b").unwrap();
        tracker.register(subscriber("csv-1"));
        tracker.register(subscriber("binary-1"));
        tracker.complete_publication();

        tracker.acknowledge("csv-1", "a", paths(&["a.csv"]));
        tracker.acknowledge("csv-1", "b", paths(&["b.csv"]));
        tracker.acknowledge("binary-1", "a", paths(&["a.bson", "a.csv"]));

        assert_eq!(
            tracker.progress(),
            Progress::Pending(vec![PendingAcknowledgement {
                group_id: "b".into(),
                consumer_id: "binary-1".into(),
            }])
        );

        tracker.acknowledge("binary-1", "b", paths(&["b.bson"]));

        assert_eq!(tracker.progress(), Progress::Consumed);
        assert_eq!(
            tracker.paths(),
            &paths(&["a.bson", "a.csv", "b.bson", "b.csv"])
        );
    }

    #[test]
    fn ignore_unknown_acknowledgements() {
        let mut tracker = CompletionTracker::default();
        tracker.record_message("a").unwrap();

        assert!(!tracker.acknowledge("ghost", "a", paths(&["x"])));
        assert!(tracker.register(subscriber("csv-1")));
        assert!(!tracker.register(subscriber("csv-1")));
        assert!(!tracker.acknowledge("csv-1", "zzz", paths(&["x"])));
        assert!(tracker.paths().is_empty());
    }

    #[test]
    fn report_subscriber_failures() {
        let mut tracker = CompletionTracker::default();
        tracker.register(subscriber("csv-1"));
        tracker.fail("csv-1", BlackboxError::from_message("disk full"));

        assert_eq!(
            tracker.progress(),
            Progress::Failed {
                consumer_id: "csv-1".into(),
                error: BlackboxError::from_message("disk full"),
            }
        );
        assert!(tracker.offered_formats().is_empty());
    }
}
