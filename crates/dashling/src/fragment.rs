use serde::Serialize;

use crate::{manifest::TimelineEntry, request::Request};

/// Lifecycle shared by fragments and requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Error,
    Aborted,
    Idle,
    Downloading,
    Downloaded,
    Appending,
    Appended,
}

impl LoadState {
    /// Position in the load pipeline. Failed states sit below `Idle`.
    const fn rank(self) -> u8 {
        match self {
            LoadState::Error | LoadState::Aborted => 0,
            LoadState::Idle => 1,
            LoadState::Downloading => 2,
            LoadState::Downloaded => 3,
            LoadState::Appending => 4,
            LoadState::Appended => 5,
        }
    }

    pub fn is_at_least(self, threshold: LoadState) -> bool {
        self.rank() >= threshold.rank()
    }

    pub fn is_at_most(self, threshold: LoadState) -> bool {
        self.rank() <= threshold.rank()
    }

    pub fn can_transition_to(self, next: LoadState) -> bool {
        use LoadState::*;

        matches!(
            (self, next),
            (Idle, Downloading)
                | (Downloading, Downloaded | Idle | Error | Aborted)
                | (Downloaded, Appending)
                | (Appending, Appended | Idle | Error)
                // Cleared by a seek, or evicted by the host.
                | (Appended, Idle)
                | (Aborted, Idle)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FragmentTime {
    pub start_seconds: f64,
    pub length_seconds: f64,
    /// Start in timescale units.
    pub start_offset: u64,
    pub length: u64,
}

impl FragmentTime {
    pub fn end_seconds(&self) -> f64 {
        self.start_seconds + self.length_seconds
    }
}

impl From<&TimelineEntry> for FragmentTime {
    fn from(entry: &TimelineEntry) -> Self {
        Self {
            start_seconds: entry.start_seconds,
            length_seconds: entry.length_seconds,
            start_offset: entry.start,
            length: entry.length,
        }
    }
}

#[derive(Debug)]
pub struct Fragment {
    pub index: usize,
    pub state: LoadState,
    /// `None` until the first download attempt.
    pub quality_index: Option<usize>,
    pub time: FragmentTime,
    pub request: Option<Request>,
}

impl Fragment {
    pub fn new(index: usize, entry: &TimelineEntry) -> Self {
        Self {
            index,
            state: LoadState::Idle,
            quality_index: None,
            time: FragmentTime::from(entry),
            request: None,
        }
    }

    /// Moves to `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: LoadState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                index = self.index,
                "Ignoring fragment transition {:?} -> {:?}",
                self.state,
                next
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Back to `Idle`, releasing the request and its payload.
    pub fn reset(&mut self) -> bool {
        if !self.transition(LoadState::Idle) {
            return false;
        }
        if let Some(mut request) = self.request.take() {
            request.dispose();
        }
        true
    }
}
