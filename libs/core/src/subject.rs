//! NATS subject helpers (env/app/topic grammar)

use crate::error::Error;

/// Characters permitted in a normalized subject token.
fn allowed(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '>' | '*' | '-')
}

/// Normalizes a topic or identifier to be subject-safe.
///
/// Lowercases and replaces anything outside `[a-z0-9_.>*-]` with `_`.
/// Normalization is idempotent.
///
/// ```
/// use courier_core::subject::normalize;
///
/// assert_eq!(normalize("Users.User Created"), "users.user_created");
/// assert_eq!(normalize(normalize("Room/42").as_str()), normalize("Room/42"));
/// ```
pub fn normalize<S: AsRef<str>>(s: S) -> String {
    let mut t: String = s
        .as_ref()
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if allowed(c) { c } else { '_' })
        .collect();
    if t.is_empty() {
        t = "unknown".into();
    }
    t
}

fn has_wildcard(s: &str) -> bool {
    s.split('.').any(|tok| tok == "*" || tok == ">")
}

fn validate_token(tok: &str, what: &str) -> Result<(), Error> {
    if tok.is_empty() {
        return Err(Error::configuration(format!("{what} must not be empty")));
    }
    if tok.contains('.') || has_wildcard(tok) {
        return Err(Error::configuration(format!(
            "{what} {tok:?} must be a single subject token without wildcards"
        )));
    }
    if tok.chars().any(|c| !allowed(c)) {
        return Err(Error::configuration(format!(
            "{what} {tok:?} contains characters outside [a-z0-9_>*.-]; normalize it first"
        )));
    }
    Ok(())
}

/// Builds the wire subject `{env}.{app}.{topic}` for a publish.
///
/// Wildcards are rejected: a publish subject must be concrete.
///
/// ```
/// use courier_core::subject::build;
///
/// assert_eq!(
///     build("test", "app1", "users.user.created").unwrap(),
///     "test.app1.users.user.created"
/// );
/// assert!(build("test", "app1", "users.*").is_err());
/// ```
pub fn build(env: &str, app: &str, topic: &str) -> Result<String, Error> {
    validate_token(env, "environment")?;
    validate_token(app, "application name")?;
    let topic = normalize(topic);
    if has_wildcard(&topic) {
        return Err(Error::publish(format!(
            "cannot publish to wildcard topic {topic:?}"
        )));
    }
    if topic.split('.').any(str::is_empty) {
        return Err(Error::publish(format!(
            "topic {topic:?} contains an empty subject token"
        )));
    }
    Ok(format!("{env}.{app}.{topic}"))
}

/// Builds a subscribe filter `{env}.{app}.{topic}`; `*` and `>` are allowed.
pub fn build_filter(env: &str, app: &str, topic: &str) -> Result<String, Error> {
    validate_token(env, "environment")?;
    validate_token(app, "application name")?;
    let topic = normalize(topic);
    if topic.split('.').any(str::is_empty) {
        return Err(Error::configuration(format!(
            "filter topic {topic:?} contains an empty subject token"
        )));
    }
    Ok(format!("{env}.{app}.{topic}"))
}

/// Parsed view of a wire subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSubject {
    pub env: String,
    pub app: String,
    pub topic: String,
}

/// Splits a wire subject back into `{env}.{app}.{topic}`.
///
/// ```
/// use courier_core::subject::parse;
///
/// let parsed = parse("test.app1.users.user.created").unwrap();
/// assert_eq!(parsed.env, "test");
/// assert_eq!(parsed.topic, "users.user.created");
/// ```
pub fn parse(subject: &str) -> Result<ParsedSubject, Error> {
    let mut parts = subject.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(env), Some(app), Some(topic)) if !env.is_empty() && !app.is_empty() && !topic.is_empty() => {
            Ok(ParsedSubject {
                env: env.to_string(),
                app: app.to_string(),
                topic: topic.to_string(),
            })
        }
        _ => Err(Error::malformed(format!(
            "subject {subject:?} does not match env.app.topic"
        ))),
    }
}

/// Events capture for the primary stream: everything under `{env}.{app}`.
pub fn events_filter(env: &str, app: &str) -> String {
    format!("{env}.{app}.>")
}

/// Dead-letter subject for an application.
pub fn dlq_subject(env: &str, app: &str) -> String {
    format!("{env}.{app}.dlq")
}

/// Derives the durable consumer name `{app}_{sanitized-filter}`.
///
/// `.`/`*`/`>` are not legal in durable names and map to `_`.
pub fn durable_name(app: &str, filter: &str) -> String {
    let sanitized: String = filter
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c => c,
        })
        .collect();
    format!("{app}_{sanitized}")
}

/// Whether `filter` (which may contain wildcards) matches a concrete subject.
pub fn filter_matches(filter: &str, subject: &str) -> bool {
    let mut ft = filter.split('.');
    let mut st = subject.split('.');
    loop {
        match (ft.next(), st.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
