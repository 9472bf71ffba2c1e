//! Event recording for the removal pipeline.
//!
//! The engines never write diagnostics to files or global state. Everything worth
//! keeping (rewritten branches, failed methods with their instruction dumps,
//! decrypted sections) is appended to an [`EventLog`] the caller passes in.
//!
//! # Example
//!
//! ```rust
//! use unconfuse::deobfuscation::{EventKind, EventLog};
//! use unconfuse::metadata::token::Token;
//!
//! let log = EventLog::new();
//! log.record(EventKind::DispatcherCollapsed)
//!     .at(Token::new(0x0600_0001), 0x12)
//!     .message("state 3 resolved to B7");
//! log.warn("handler could not be unflattened");
//!
//! assert_eq!(log.len(), 2);
//! assert!(log.has(EventKind::DispatcherCollapsed));
//! assert_eq!(log.warnings().count(), 1);
//! ```

use std::{collections::HashMap, fmt};

use strum::{Display, EnumIter};

use crate::metadata::token::Token;

/// Categories of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum EventKind {
    /// A protection was found in the module.
    #[strum(to_string = "protection detected")]
    ProtectionDetected,
    /// A protection was removed from the module.
    #[strum(to_string = "protection removed")]
    ProtectionRemoved,
    /// A block tail was rewritten to jump past a dispatcher chain.
    #[strum(to_string = "dispatcher collapsed")]
    DispatcherCollapsed,
    /// A dispatcher chain could not be resolved; the edge was kept.
    #[strum(to_string = "branch unresolved")]
    BranchUnresolved,
    /// Unreachable blocks were dropped.
    #[strum(to_string = "blocks removed")]
    BlocksRemoved,
    /// Discard instructions were inserted before a jump to the method entry.
    #[strum(to_string = "stack repaired")]
    StackRepaired,
    /// A method body was replaced by its unflattened form.
    #[strum(to_string = "method deobfuscated")]
    MethodDeobfuscated,
    /// A method could not be deobfuscated; its original body was kept.
    #[strum(to_string = "method failed")]
    MethodFailed,
    /// The anti-tamper key was derived.
    #[strum(to_string = "key derived")]
    KeyDerived,
    /// The captured-sequence deriver failed and the closed form was used.
    #[strum(to_string = "derivation fallback")]
    DerivationFallback,
    /// An encrypted section was decrypted in place.
    #[strum(to_string = "section decrypted")]
    SectionDecrypted,
    /// A proxy delegate invocation was replaced by a direct call.
    #[strum(to_string = "proxy resolved")]
    ProxyResolved,
    /// An obfuscator method, type or call was removed.
    #[strum(to_string = "artifact removed")]
    ArtifactRemoved,
    /// Informational message.
    #[strum(to_string = "info")]
    Info,
    /// Something unexpected but recoverable.
    #[strum(to_string = "warning")]
    Warning,
    /// Something failed.
    #[strum(to_string = "error")]
    Error,
}

impl EventKind {
    /// Returns true if this event represents a code or data transformation.
    #[must_use]
    pub fn is_transformation(&self) -> bool {
        matches!(
            self,
            Self::ProtectionRemoved
                | Self::DispatcherCollapsed
                | Self::BlocksRemoved
                | Self::StackRepaired
                | Self::MethodDeobfuscated
                | Self::SectionDecrypted
                | Self::ProxyResolved
                | Self::ArtifactRemoved
        )
    }

    /// Returns true for failures and diagnostics.
    #[must_use]
    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            Self::Info
                | Self::Warning
                | Self::Error
                | Self::MethodFailed
                | Self::BranchUnresolved
                | Self::DerivationFallback
        )
    }
}

/// A single logged event.
#[derive(Debug, Clone)]
pub struct Event {
    /// The type of event.
    pub kind: EventKind,
    /// The method the event belongs to, if any.
    pub method: Option<Token>,
    /// Byte offset inside the method, if any.
    pub location: Option<u64>,
    /// Human-readable description.
    pub message: String,
    /// Instruction listing attached to failures.
    pub dump: Vec<String>,
}

impl Event {
    fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            method: None,
            location: None,
            message: message.into(),
            dump: Vec::new(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(method) = self.method {
            write!(f, " {method}")?;
            if let Some(location) = self.location {
                write!(f, "@IL_{location:04X}")?;
            }
        }
        write!(f, " {}", self.message)
    }
}

/// Fluent event builder, created by [`EventLog::record`].
///
/// The event is added to the log when the builder is dropped.
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    event: Option<Event>,
}

impl EventBuilder<'_> {
    /// Sets the method and the offset inside it.
    pub fn at(mut self, method: Token, location: u64) -> Self {
        if let Some(event) = self.event.as_mut() {
            event.method = Some(method);
            event.location = Some(location);
        }
        self
    }

    /// Sets only the method.
    pub fn method(mut self, method: Token) -> Self {
        if let Some(event) = self.event.as_mut() {
            event.method = Some(method);
        }
        self
    }

    /// Sets the message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        if let Some(event) = self.event.as_mut() {
            event.message = message.into();
        }
        self
    }

    /// Attaches an instruction listing.
    pub fn dump(mut self, dump: Vec<String>) -> Self {
        if let Some(event) = self.event.as_mut() {
            event.dump = dump;
        }
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.log.events.push(event);
        }
    }
}

/// Append-only collection of events.
///
/// Events are appended through `&self`, so one log can be shared by reference
/// between the pipeline and every protection it runs.
#[derive(Debug, Default)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        self.iter().cloned().collect()
    }
}

impl EventLog {
    /// Creates an empty event log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no events have been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.count() == 0
    }

    /// Returns the total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Starts building an event of the given kind.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder {
            log: self,
            event: Some(Event::new(kind, kind.to_string())),
        }
    }

    /// Records an informational message.
    pub fn info(&self, message: impl Into<String>) {
        self.events.push(Event::new(EventKind::Info, message));
    }

    /// Records a warning.
    pub fn warn(&self, message: impl Into<String>) {
        self.events.push(Event::new(EventKind::Warning, message));
    }

    /// Records an error.
    pub fn error(&self, message: impl Into<String>) {
        self.events.push(Event::new(EventKind::Error, message));
    }

    /// Returns true if any event of the given kind exists.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.iter().any(|event| event.kind == kind)
    }

    /// Counts events of the given kind.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.filter_kind(kind).count()
    }

    /// Iterates over all events in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().map(|(_, event)| event)
    }

    /// Iterates over events of one kind.
    pub fn filter_kind(&self, kind: EventKind) -> impl Iterator<Item = &Event> + '_ {
        self.iter().filter(move |event| event.kind == kind)
    }

    /// Iterates over events of one method.
    pub fn filter_method(&self, method: Token) -> impl Iterator<Item = &Event> + '_ {
        self.iter().filter(move |event| event.method == Some(method))
    }

    /// Iterates over warnings.
    pub fn warnings(&self) -> impl Iterator<Item = &Event> + '_ {
        self.filter_kind(EventKind::Warning)
    }

    /// Iterates over errors.
    pub fn errors(&self) -> impl Iterator<Item = &Event> + '_ {
        self.filter_kind(EventKind::Error)
    }

    /// Counts events grouped by kind.
    #[must_use]
    pub fn count_by_kind(&self) -> HashMap<EventKind, usize> {
        let mut counts = HashMap::new();
        for event in self.iter() {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }

    /// One-line summary of the transformation counts.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "no events".to_string();
        }

        let mut parts: Vec<String> = self
            .count_by_kind()
            .into_iter()
            .filter(|(kind, _)| kind.is_transformation())
            .map(|(kind, count)| format!("{count} {kind}"))
            .collect();

        if parts.is_empty() {
            return format!("{} events", self.len());
        }

        parts.sort();
        parts.join(", ")
    }
}

impl FromIterator<Event> for EventLog {
    fn from_iter<T: IntoIterator<Item = Event>>(iter: T) -> Self {
        let log = Self::new();
        for event in iter {
            log.events.push(event);
        }
        log
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_record_builder() {
        let log = EventLog::new();
        let method = Token::new(0x0600_0002);
        log.record(EventKind::MethodFailed)
            .method(method)
            .message("still obfuscated")
            .dump(vec!["IL_0000: ret".to_string()]);

        let event = log.iter().next().unwrap();
        assert_eq!(event.kind, EventKind::MethodFailed);
        assert_eq!(event.method, Some(method));
        assert_eq!(event.dump.len(), 1);
        assert_eq!(log.filter_method(method).count(), 1);
    }

    #[test]
    fn test_default_message_and_display() {
        let log = EventLog::new();
        log.record(EventKind::StackRepaired).at(Token::new(0x0600_0001), 0x1A);
        let event = log.iter().next().unwrap();
        assert_eq!(event.message, "stack repaired");
        assert_eq!(event.to_string(), "[stack repaired] 0x06000001@IL_001A stack repaired");
    }

    #[test]
    fn test_summary_counts_transformations() {
        let log = EventLog::new();
        assert_eq!(log.summary(), "no events");

        log.info("starting");
        assert_eq!(log.summary(), "1 events");

        log.record(EventKind::DispatcherCollapsed);
        log.record(EventKind::DispatcherCollapsed);
        log.record(EventKind::BlocksRemoved);
        assert_eq!(log.summary(), "1 blocks removed, 2 dispatcher collapsed");
        assert_eq!(log.count_kind(EventKind::DispatcherCollapsed), 2);

        let copy = log.clone();
        assert_eq!(copy.len(), log.len());
    }

    #[test]
    fn test_kind_classification() {
        for kind in EventKind::iter() {
            assert!(
                !(kind.is_transformation() && kind.is_diagnostic()),
                "{kind} is both"
            );
        }
        assert!(EventKind::MethodFailed.is_diagnostic());
        assert!(EventKind::SectionDecrypted.is_transformation());
    }
}
