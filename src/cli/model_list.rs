//! Model listing
//!
//! Prints the catalog grouped by provider, with each provider's status.

use std::fmt::Write;

use crate::core::providers::ProviderKind;
use crate::core::session::SessionContext;

pub fn list_models(session: &SessionContext, explicit: Option<&str>) {
    print!("{}", format_model_list(session, explicit));
}

pub fn format_model_list(session: &SessionContext, explicit: Option<&str>) -> String {
    let selected = session.select_model(explicit);
    let mut out = String::new();
    let _ = writeln!(out, "🤖 Available Models");
    let _ = writeln!(out, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for kind in ProviderKind::ALL {
        let _ = writeln!(out);
        let _ = writeln!(out, "{} ({})", kind.display_name(), provider_status(session, kind));
        let mut models = session.registry().models_for(kind).peekable();
        if models.peek().is_none() {
            let _ = writeln!(out, "  (no models)");
        }
        for entry in models {
            let marker = if selected.as_deref() == Some(entry.id.as_str()) {
                "*"
            } else {
                " "
            };
            let mut flags = Vec::new();
            if entry.supports_images {
                flags.push("images");
            }
            if entry.supports_tools {
                flags.push("tools");
            }
            let _ = write!(out, "{marker} {}", entry.id);
            if !flags.is_empty() {
                let _ = write!(out, " [{}]", flags.join(", "));
            }
            if let Some(length) = entry.context_length {
                let _ = write!(out, " ctx={length}");
            }
            let _ = writeln!(out);
        }
    }

    if let Some(model) = selected {
        let _ = writeln!(out);
        let _ = writeln!(out, "🎯 Selected model: {model}");
    }
    out
}

fn provider_status(session: &SessionContext, kind: ProviderKind) -> String {
    if let Some(err) = session.provider_error(kind) {
        return format!("unavailable: {err}");
    }
    if session.provider_available(kind) {
        "available".to_string()
    } else {
        "not reachable".to_string()
    }
}
