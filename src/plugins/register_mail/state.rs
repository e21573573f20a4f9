//! Subscriber list and send queue of the RegisterMail plugin, without any I/O.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::db::Announcement;
use crate::plugins::mailer::SmtpSettings;
use crate::services::hash;

/// An item is dropped once it has failed more than this many times.
pub const MAX_SEND_RETRIES: u32 = 10;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMailConfig {
    pub subject_prefix: String,
    pub from: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    /// Mails per tick, 0 sends the whole queue.
    pub rate_limit: usize,
    pub register_mail_text: String,
    pub unregister_link_text: String,
    pub register_password: String,
    /// Public URL of the tenant page, used to build links in mails.
    pub server_name: String,
}

impl RegisterMailConfig {
    pub fn is_complete(&self) -> bool {
        !self.from.is_empty()
            && !self.smtp_server.is_empty()
            && self.smtp_port != 0
            && !self.smtp_user.is_empty()
            && !self.smtp_password.is_empty()
            && !self.register_mail_text.is_empty()
            && !self.unregister_link_text.is_empty()
            && !self.server_name.is_empty()
    }

    pub fn smtp(&self) -> SmtpSettings {
        SmtpSettings {
            server: self.smtp_server.clone(),
            port: self.smtp_port,
            user: self.smtp_user.clone(),
            password: self.smtp_password.clone(),
        }
    }

    fn link(&self, page: &str, salt: &str, mail: &str) -> String {
        format!(
            "{}/RegisterMail/{page}?key={}&mail={}",
            self.server_name.trim_end_matches('/'),
            urlencoding::encode(salt),
            urlencoding::encode(mail)
        )
    }

    pub fn verify_url(&self, salt: &str, mail: &str) -> String {
        self.link("verify.html", salt, mail)
    }

    pub fn unsubscribe_url(&self, salt: &str, mail: &str) -> String {
        self.link("unsubscribe.html", salt, mail)
    }
}

/// One registered address. `hash == true` means `data` holds the salted hash: the address is
/// either waiting for confirmation or banned. Otherwise `data` is the confirmed plain address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub data: String,
    pub salt: String,
    pub hash: bool,
}

impl Subscriber {
    pub fn hashed(address: &str) -> Self {
        let (data, salt) = hash::hash(address);
        Self {
            data,
            salt,
            hash: true,
        }
    }

    /// Whether this entry stands for `address`, plain or hashed.
    pub fn matches(&self, address: &str) -> bool {
        if self.hash {
            hash::verify(address, &self.salt, &self.data)
        } else {
            self.data == address
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub to: Subscriber,
    pub announcement: Announcement,
    pub number_errors: u32,
    pub unsubscribe_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeRejection {
    AlreadySubscribed,
    Blocked,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMailState {
    pub config: RegisterMailConfig,
    pub subscribers: Vec<Subscriber>,
    pub queue: VecDeque<QueueItem>,
}

impl RegisterMailState {
    /// Adds a pending entry and queues the verification mail.
    pub fn subscribe(&mut self, address: &str, description: &str) -> Result<(), SubscribeRejection> {
        for subscriber in &self.subscribers {
            if subscriber.hash {
                if subscriber.matches(address) {
                    return Err(SubscribeRejection::Blocked);
                }
            } else if subscriber.data == address {
                return Err(SubscribeRejection::AlreadySubscribed);
            }
        }

        let entry = Subscriber::hashed(address);
        let url = self.config.verify_url(&entry.salt, address);
        self.queue.push_back(QueueItem {
            to: Subscriber {
                data: address.to_string(),
                salt: entry.salt.clone(),
                hash: false,
            },
            announcement: Announcement::new(
                description,
                format!("{}\n\n{url}", self.config.register_mail_text),
            ),
            number_errors: 0,
            unsubscribe_url: None,
        });
        self.subscribers.push(entry);
        Ok(())
    }

    /// Confirms the entry with `salt` if `address` matches. Already confirmed entries succeed again.
    pub fn verify(&mut self, salt: &str, address: &str) -> bool {
        for subscriber in self.subscribers.iter_mut().filter(|s| s.salt == salt) {
            if !subscriber.hash {
                return subscriber.data == address;
            }
            if subscriber.matches(address) {
                subscriber.data = address.to_string();
                subscriber.hash = false;
                return true;
            }
        }
        false
    }

    fn drop_queued_for(&mut self, salt: &str) {
        self.queue.retain(|item| item.to.salt != salt);
    }

    /// Removes a confirmed entry. Returns whether anything changed; callers report success
    /// either way so the response never reveals the subscription state.
    pub fn unsubscribe(&mut self, salt: &str, address: &str) -> bool {
        let position = self
            .subscribers
            .iter()
            .position(|s| s.salt == salt && !s.hash && s.data == address);
        match position {
            Some(index) => {
                self.subscribers.swap_remove(index);
                self.drop_queued_for(salt);
                true
            }
            None => false,
        }
    }

    /// Forgets the address entirely, so it may register again.
    pub fn delete(&mut self, address: &str) -> bool {
        let Some(index) = self.subscribers.iter().position(|s| s.matches(address)) else {
            return false;
        };
        let removed = self.subscribers.swap_remove(index);
        self.drop_queued_for(&removed.salt);
        true
    }

    /// Keeps only a hash of the address, which blocks future registrations.
    pub fn ban(&mut self, address: &str) {
        match self.subscribers.iter_mut().find(|s| s.matches(address)) {
            Some(subscriber) => {
                let salt = subscriber.salt.clone();
                if !subscriber.hash {
                    // An undecodable salt cannot be reused; the ban gets a fresh one instead.
                    *subscriber = match hash::hash_with_salt(address, &salt) {
                        Some(data) => Subscriber {
                            data,
                            salt: salt.clone(),
                            hash: true,
                        },
                        None => Subscriber::hashed(address),
                    };
                }
                self.drop_queued_for(&salt);
            }
            None => self.subscribers.push(Subscriber::hashed(address)),
        }
    }

    /// Queues the announcement for every confirmed address.
    pub fn enqueue_announcement(&mut self, announcement: &Announcement) -> usize {
        let mut queued = 0;
        for subscriber in self.subscribers.iter().filter(|s| !s.hash) {
            let url = self.config.unsubscribe_url(&subscriber.salt, &subscriber.data);
            self.queue.push_back(QueueItem {
                to: subscriber.clone(),
                announcement: Announcement {
                    header: announcement.header.clone(),
                    message: format!(
                        "{}\n\n{}\n\n{url}",
                        announcement.message, self.config.unregister_link_text
                    ),
                    time: announcement.time,
                },
                number_errors: 0,
                unsubscribe_url: Some(url),
            });
            queued += 1;
        }
        queued
    }

    /// Removes the items due this tick from the front of the queue.
    pub fn take_batch(&mut self) -> Vec<QueueItem> {
        let count = match self.config.rate_limit {
            0 => self.queue.len(),
            n => n.min(self.queue.len()),
        };
        self.queue.drain(..count).collect()
    }

    /// Puts a transiently failed item back at the tail, or hands it back once it is out of retries.
    pub fn retry(&mut self, mut item: QueueItem) -> Option<QueueItem> {
        item.number_errors += 1;
        if item.number_errors <= MAX_SEND_RETRIES {
            self.queue.push_back(item);
            None
        } else {
            Some(item)
        }
    }

    pub fn confirmed(&self) -> Vec<&str> {
        self.subscribers
            .iter()
            .filter(|s| !s.hash)
            .map(|s| s.data.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RegisterMailState {
        RegisterMailState {
            config: RegisterMailConfig {
                register_mail_text: "Please confirm".to_string(),
                unregister_link_text: "Unsubscribe here:".to_string(),
                server_name: "https://example.org/news/".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_subscribe_adds_pending_entry_and_verification_mail() {
        let mut state = state();
        state.subscribe("a@example.org", "News").unwrap();

        assert_eq!(state.subscribers.len(), 1);
        let entry = &state.subscribers[0];
        assert!(entry.hash);
        assert_ne!(entry.data, "a@example.org");
        assert!(hash::verify("a@example.org", &entry.salt, &entry.data));

        assert_eq!(state.queue.len(), 1);
        let item = &state.queue[0];
        assert_eq!(item.to.data, "a@example.org");
        assert!(!item.to.hash);
        assert_eq!(item.announcement.header, "News");
        let expected = format!(
            "https://example.org/news/RegisterMail/verify.html?key={}&mail=a%40example.org",
            urlencoding::encode(&entry.salt)
        );
        assert!(item.announcement.message.starts_with("Please confirm\n\n"));
        assert!(item.announcement.message.ends_with(&expected));
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let mut state = state();
        state.subscribe("a@example.org", "News").unwrap();
        // Pending (hashed) entry.
        assert_eq!(
            state.subscribe("a@example.org", "News"),
            Err(SubscribeRejection::Blocked)
        );

        let salt = state.subscribers[0].salt.clone();
        assert!(state.verify(&salt, "a@example.org"));
        assert_eq!(
            state.subscribe("a@example.org", "News"),
            Err(SubscribeRejection::AlreadySubscribed)
        );
        // Exact match only.
        assert!(state.subscribe("A@example.org", "News").is_ok());
        assert_eq!(state.subscribers.len(), 2);
    }

    #[test]
    fn test_verify() {
        let mut state = state();
        state.subscribe("a@example.org", "News").unwrap();
        let salt = state.subscribers[0].salt.clone();

        assert!(!state.verify(&salt, "b@example.org"));
        assert!(!state.verify("other-salt", "a@example.org"));
        assert!(state.subscribers[0].hash);

        assert!(state.verify(&salt, "a@example.org"));
        assert_eq!(
            state.subscribers[0],
            Subscriber {
                data: "a@example.org".to_string(),
                salt: salt.clone(),
                hash: false
            }
        );
        // Idempotent.
        assert!(state.verify(&salt, "a@example.org"));
        assert_eq!(state.confirmed(), vec!["a@example.org"]);
    }

    fn confirmed(state: &mut RegisterMailState, address: &str) -> String {
        state.subscribe(address, "News").unwrap();
        let salt = state.subscribers.last().unwrap().salt.clone();
        assert!(state.verify(&salt, address));
        salt
    }

    #[test]
    fn test_unsubscribe_removes_only_exact_plain_match() {
        let mut state = state();
        let salt_a = confirmed(&mut state, "a@example.org");
        let _salt_b = confirmed(&mut state, "b@example.org");
        state.queue.clear();
        state.enqueue_announcement(&Announcement::new("h", "m"));
        assert_eq!(state.queue.len(), 2);

        assert!(!state.unsubscribe(&salt_a, "b@example.org"));
        assert!(!state.unsubscribe("nope", "a@example.org"));
        assert_eq!(state.subscribers.len(), 2);

        assert!(state.unsubscribe(&salt_a, "a@example.org"));
        assert_eq!(state.confirmed(), vec!["b@example.org"]);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].to.data, "b@example.org");
    }

    #[test]
    fn test_unsubscribe_of_hashed_entry_changes_nothing() {
        let mut state = state();
        state.subscribe("a@example.org", "News").unwrap();
        let salt = state.subscribers[0].salt.clone();
        assert!(!state.unsubscribe(&salt, "a@example.org"));
        assert_eq!(state.subscribers.len(), 1);
    }

    #[test]
    fn test_ban_and_delete() {
        let mut state = state();
        let salt = confirmed(&mut state, "a@example.org");
        state.enqueue_announcement(&Announcement::new("h", "m"));

        state.ban("a@example.org");
        let entry = &state.subscribers[0];
        assert!(entry.hash);
        assert_eq!(entry.salt, salt);
        assert!(state.queue.is_empty());
        assert_eq!(
            state.subscribe("a@example.org", "News"),
            Err(SubscribeRejection::Blocked)
        );

        // Banning an unknown address stores only its hash.
        state.ban("spam@example.org");
        assert_eq!(state.subscribers.len(), 2);
        assert!(state.subscribers.iter().all(|s| s.hash));
        assert!(!state.subscribers.iter().any(|s| s.data.contains("spam")));

        assert!(state.delete("a@example.org"));
        assert!(!state.delete("a@example.org"));
        assert!(state.subscribe("a@example.org", "News").is_ok());
    }

    #[test]
    fn test_ban_with_corrupt_salt_still_blocks() {
        let mut state = state();
        state.subscribers.push(Subscriber {
            data: "a@example.org".to_string(),
            salt: "not base64!".to_string(),
            hash: false,
        });
        state.enqueue_announcement(&Announcement::new("h", "m"));

        state.ban("a@example.org");
        let entry = &state.subscribers[0];
        assert!(entry.hash);
        assert!(!entry.data.is_empty());
        assert!(hash::verify("a@example.org", &entry.salt, &entry.data));
        assert!(state.queue.is_empty());
        assert_eq!(
            state.subscribe("a@example.org", "News"),
            Err(SubscribeRejection::Blocked)
        );
    }

    #[test]
    fn test_enqueue_skips_unconfirmed_and_appends_unsubscribe_link() {
        let mut state = state();
        let salt = confirmed(&mut state, "a@example.org");
        state.subscribe("pending@example.org", "News").unwrap();
        state.queue.clear();

        assert_eq!(state.enqueue_announcement(&Announcement::new("Hello", "Body")), 1);
        let item = &state.queue[0];
        let url = state.config.unsubscribe_url(&salt, "a@example.org");
        assert_eq!(item.unsubscribe_url.as_deref(), Some(url.as_str()));
        assert_eq!(
            item.announcement.message,
            format!("Body\n\nUnsubscribe here:\n\n{url}")
        );
    }

    #[test]
    fn test_take_batch_respects_rate_limit() {
        let mut state = state();
        for i in 0..5 {
            confirmed(&mut state, &format!("{i}@example.org"));
        }
        state.queue.clear();
        state.enqueue_announcement(&Announcement::new("h", "m"));

        state.config.rate_limit = 2;
        assert_eq!(state.take_batch().len(), 2);
        assert_eq!(state.queue.len(), 3);

        state.config.rate_limit = 0;
        assert_eq!(state.take_batch().len(), 3);
        assert!(state.queue.is_empty());
        assert!(state.take_batch().is_empty());
    }

    #[test]
    fn test_retry_ceiling() {
        let mut state = state();
        let item = QueueItem {
            to: Subscriber {
                data: "a@example.org".to_string(),
                salt: "s".to_string(),
                hash: false,
            },
            announcement: Announcement::new("h", "m"),
            number_errors: MAX_SEND_RETRIES - 1,
            unsubscribe_url: None,
        };

        assert!(state.retry(item).is_none());
        let requeued = state.queue.pop_front().unwrap();
        assert_eq!(requeued.number_errors, MAX_SEND_RETRIES);

        let dropped = state.retry(requeued).unwrap();
        assert_eq!(dropped.number_errors, MAX_SEND_RETRIES + 1);
        assert!(state.queue.is_empty());
    }
}
