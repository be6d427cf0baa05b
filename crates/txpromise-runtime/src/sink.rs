//! The default unhandled-rejection sink: emits a single warning per
//! unhandled rejection at tick end. Installed once per
//! [`crate::LocalRuntime::new`], routed through `tracing` rather than a
//! raw `eprintln!` — logging lives at this crate's host-integration
//! boundary, not inside `txpromise-core`.

use std::rc::Rc;

use txpromise_core::UnhandledEntry;

pub(crate) fn install_default_sink() {
    txpromise_core::scope::set_root_sink(Rc::new(|entry: &UnhandledEntry| {
        let reason = entry.long_stack.as_deref().unwrap_or(entry.message.as_str());
        tracing::warn!(scope = %entry.promise, reason = %reason, "unhandled promise rejection");
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use txpromise_types::ScopeId;

    #[test_log::test]
    fn installing_the_sink_does_not_panic() {
        install_default_sink();
    }

    #[test_log::test]
    fn prefers_the_long_stack_over_the_bare_message_when_present() {
        install_default_sink();
        let reason: Rc<dyn Any> = Rc::new("boom".to_string());
        let with_stack = UnhandledEntry {
            reason_ptr: 0xfeed,
            reason: reason.clone(),
            message: "boom".into(),
            promise: ScopeId::ROOT,
            long_stack: Some("boom\nFrom previous:\nroot".into()),
        };
        assert_eq!(
            with_stack.long_stack.as_deref().unwrap_or(with_stack.message.as_str()),
            "boom\nFrom previous:\nroot"
        );
        let without_stack = UnhandledEntry { long_stack: None, ..with_stack };
        assert_eq!(
            without_stack.long_stack.as_deref().unwrap_or(without_stack.message.as_str()),
            "boom"
        );
    }
}
