use chrono::{DateTime, Duration, Utc};

use crate::store::{
    Filter, FilterValue, UserRecord, UserStore, FIELD_IS_SUBSCRIBED, FIELD_LAST_ACTIVITY,
    FIELD_TRIAL_START,
};
use crate::telegram::{truncate_to, MAX_MESSAGE_LEN};

const AVAILABLE_COMMANDS: &str =
    "/emails, /unsubscribed, /status, /newusers, /expiredtrial, /inactive";

/// A recognized operator command, or the raw text when nothing matched.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Emails,
    Unsubscribed,
    Status,
    NewUsers,
    ExpiredTrial,
    Inactive,
    Unrecognized(String),
}

impl Command {
    /// Match on the trimmed, lowercased text. Unrecognized input keeps its
    /// trimmed original form for the error reply.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "/emails" => Self::Emails,
            "/unsubscribed" => Self::Unsubscribed,
            "/status" => Self::Status,
            "/newusers" => Self::NewUsers,
            "/expiredtrial" => Self::ExpiredTrial,
            "/inactive" => Self::Inactive,
            _ => Self::Unrecognized(trimmed.to_string()),
        }
    }
}

/// Resolve `text` to a reply message. Store failures never escape this
/// function: they come back as operator-readable error text.
pub async fn respond(store: &UserStore, text: &str) -> String {
    let now = Utc::now();

    let reply = match Command::parse(text) {
        Command::Emails => email_list(store, &[], "No emails found.", "emails").await,
        Command::Unsubscribed => {
            email_list(
                store,
                &unsubscribed_filters(),
                "No unsubscribed users.",
                "unsubscribed users",
            )
            .await
        }
        Command::Status => status_message(store),
        Command::NewUsers => {
            user_list(
                store,
                &new_users_filters(now),
                "No new users in the last 24h.",
                "new users",
            )
            .await
        }
        Command::ExpiredTrial => {
            user_list(
                store,
                &expired_trial_filters(now),
                "No users with expired trial.",
                "expired trials",
            )
            .await
        }
        Command::Inactive => {
            email_list(
                store,
                &inactive_filters(now),
                "No inactive users found.",
                "inactive users",
            )
            .await
        }
        Command::Unrecognized(msg) => format!(
            "Command not recognized: {msg}. Available commands: {AVAILABLE_COMMANDS}"
        ),
    };

    truncate_to(&reply, MAX_MESSAGE_LEN).to_string()
}

fn status_message(store: &UserStore) -> String {
    if store.is_connected() {
        "Firebase is connected and operational.".to_string()
    } else {
        "Firebase is not properly initialized.".to_string()
    }
}

fn unsubscribed_filters() -> Vec<Filter> {
    vec![Filter::equal(FIELD_IS_SUBSCRIBED, FilterValue::Bool(false))]
}

fn new_users_filters(now: DateTime<Utc>) -> Vec<Filter> {
    vec![Filter::at_least(FIELD_TRIAL_START, now - Duration::hours(24))]
}

/// Unsubscribed users whose trial started between 14 and 3 days ago.
fn expired_trial_filters(now: DateTime<Utc>) -> Vec<Filter> {
    vec![
        Filter::equal(FIELD_IS_SUBSCRIBED, FilterValue::Bool(false)),
        Filter::at_least(FIELD_TRIAL_START, now - Duration::days(14)),
        Filter::at_most(FIELD_TRIAL_START, now - Duration::days(3)),
    ]
}

fn inactive_filters(now: DateTime<Utc>) -> Vec<Filter> {
    vec![Filter::at_most(FIELD_LAST_ACTIVITY, now - Duration::days(14))]
}

/// Newline-joined emails; records without an email are skipped.
async fn email_list(
    store: &UserStore,
    filters: &[Filter],
    empty_message: &str,
    what: &str,
) -> String {
    match store.query_users(filters).await {
        Ok(records) => {
            let emails: Vec<&str> = records
                .iter()
                .filter_map(|r| r.email.as_deref())
                .filter(|email| !email.is_empty())
                .collect();
            if emails.is_empty() {
                empty_message.to_string()
            } else {
                emails.join("\n")
            }
        }
        Err(e) => format!("Error getting {what}: {e}"),
    }
}

/// One `{name} - {email}` line per record.
async fn user_list(
    store: &UserStore,
    filters: &[Filter],
    empty_message: &str,
    what: &str,
) -> String {
    match store.query_users(filters).await {
        Ok(records) if records.is_empty() => empty_message.to_string(),
        Ok(records) => records
            .iter()
            .map(user_line)
            .collect::<Vec<_>>()
            .join("\n"),
        Err(e) => format!("Error getting {what}: {e}"),
    }
}

/// `{first} {last} - {email}`, with absent name parts dropped and a
/// "No email" placeholder when the address is missing.
pub(crate) fn user_line(record: &UserRecord) -> String {
    let name: Vec<&str> = [record.first_name.as_deref(), record.last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    let email = record.email.as_deref().unwrap_or("No email");

    format!("{} - {}", name.join(" "), email)
}
