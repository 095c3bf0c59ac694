//! Watchdog policy for turns whose backing process went silent.
//!
//! A processing session gets the base inactivity timeout unless something
//! suggests legitimate long-running work, in which case the longer tool
//! timeout applies. The periodic timer lives in
//! [`crate::actors::WatchdogActor`]; recovery itself runs inside the session
//! hub through the same abort path as a user cancellation.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

use crate::config::WatchdogSettings;
use crate::session::SessionRecord;
use crate::turn::StuckTurn;

/// Whether a processing session qualifies for the longer tool timeout.
pub fn uses_tool_timeout(record: &SessionRecord, is_multi_agent: bool) -> bool {
    record.active_tool_calls() > 0
        || record.is_resumed()
        || record.has_used_tools_this_turn()
        || is_multi_agent
}

pub fn effective_timeout(
    record: &SessionRecord,
    settings: &WatchdogSettings,
    is_multi_agent: bool,
) -> Duration {
    if uses_tool_timeout(record, is_multi_agent) {
        settings.tool_timeout()
    } else {
        settings.inactivity_timeout()
    }
}

/// How long the session's open turn has been running as of `now`.
pub fn elapsed(record: &SessionRecord, now: DateTime<Utc>) -> Option<Duration> {
    let started = record.processing_started_at()?;
    Some((now - started).to_std().unwrap_or(Duration::ZERO))
}

/// Every processing session whose turn has outlived its effective timeout.
pub fn find_stuck<'a>(
    sessions: impl IntoIterator<Item = &'a SessionRecord>,
    settings: &WatchdogSettings,
    now: DateTime<Utc>,
    multi_agent: &HashSet<String>,
) -> Vec<StuckTurn> {
    let mut stuck: Vec<StuckTurn> = sessions
        .into_iter()
        .filter(|r| r.is_processing())
        .filter_map(|record| {
            let elapsed = elapsed(record, now)?;
            let timeout = effective_timeout(record, settings, multi_agent.contains(record.name()));
            (elapsed > timeout).then(|| StuckTurn {
                session: record.name().to_string(),
                elapsed,
                timeout,
            })
        })
        .collect();
    stuck.sort_by(|a, b| a.session.cmp(&b.session));
    stuck
}

/// Operator-visible transcript notice for a recovered turn.
pub fn recovery_notice(turn: &StuckTurn) -> String {
    format!(
        "No response from the agent for {}s (limit {}s). The turn was stopped; send a new message to continue.",
        turn.elapsed.as_secs(),
        turn.timeout.as_secs()
    )
}
