//! Mock publish adapter for testing
//!
//! Scripts per-call outcomes so tests can exercise retry paths,
//! permanent failures, and success without network access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{PublishError, Result};
use crate::publisher::PublishAdapter;

/// A recorded publish call, for assertions
#[derive(Debug, Clone)]
pub struct PublishedPost {
    pub author_id: String,
    pub content: String,
    pub image_ref: Option<String>,
}

pub struct MockAdapter {
    /// Outcomes consumed front-to-back; when empty, calls succeed with
    /// `default_post_id`
    scripted: Mutex<VecDeque<std::result::Result<String, PublishError>>>,
    default_post_id: String,
    calls: AtomicUsize,
    published: Mutex<Vec<PublishedPost>>,
}

impl MockAdapter {
    /// Adapter that always succeeds with the given post id
    pub fn success(post_id: &str) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default_post_id: post_id.to_string(),
            calls: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Adapter that fails every call with the given error
    pub fn failing(error: PublishError) -> Self {
        let adapter = Self::success("unused");
        // A long enough script for any retry budget under test
        let mut scripted = adapter.scripted.lock().unwrap();
        for _ in 0..64 {
            scripted.push_back(Err(error.clone()));
        }
        drop(scripted);
        adapter
    }

    /// Adapter that fails `n` times with the given error, then succeeds
    pub fn fail_times_then_succeed(n: usize, error: PublishError, post_id: &str) -> Self {
        let adapter = Self::success(post_id);
        let mut scripted = adapter.scripted.lock().unwrap();
        for _ in 0..n {
            scripted.push_back(Err(error.clone()));
        }
        drop(scripted);
        adapter
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishedPost> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublishAdapter for MockAdapter {
    async fn publish(
        &self,
        _access_token: &str,
        author_id: &str,
        content: &str,
        image_ref: Option<&str>,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let outcome = self.scripted.lock().unwrap().pop_front();
        match outcome {
            Some(Err(e)) => Err(e.into()),
            Some(Ok(id)) => {
                self.published.lock().unwrap().push(PublishedPost {
                    author_id: author_id.to_string(),
                    content: content.to_string(),
                    image_ref: image_ref.map(String::from),
                });
                Ok(id)
            }
            None => {
                self.published.lock().unwrap().push(PublishedPost {
                    author_id: author_id.to_string(),
                    content: content.to_string(),
                    image_ref: image_ref.map(String::from),
                });
                Ok(self.default_post_id.clone())
            }
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
