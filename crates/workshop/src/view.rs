//! Text rendering of the workshop page.

use std::fmt::Write;

use serde::Serialize;

use crate::adapter::{ActionKind, Invocation, WorkshopState};

/// Renders the whole page.
#[must_use]
pub fn render(state: &WorkshopState) -> String {
    let mut page = String::new();

    let connect = if state.connecting {
        "[connect] Discovering..."
    } else {
        "[connect] Discover & connect a device"
    };
    line(&mut page, connect);

    if let Some(err) = &state.connection_error {
        line(&mut page, "Connection error:");
        line(&mut page, &pretty(err));
    } else if let Some(session_id) = state.session_id {
        line(&mut page, &format!("Connected! SessionId: {session_id}"));
        let status = state
            .session_state
            .as_ref()
            .map_or_else(|| "loading".to_string(), |s| s.device_status.to_string());
        line(&mut page, &format!("Session status: {status}"));
        if let Some(name) = state.session_state.as_ref().and_then(|s| s.device_name.as_deref()) {
            line(&mut page, &format!("Device: {name}"));
        }
    } else {
        line(&mut page, "No active session. First discover and connect a device.");
    }
    page.push('\n');

    line(&mut page, &format!("[path] Derivation path: {}", state.derivation_path));
    let tx = if state.transaction.is_empty() {
        "(empty)"
    } else {
        state.transaction.as_str()
    };
    line(&mut page, &format!("[tx] Transaction: {tx}"));
    page.push('\n');

    control(&mut page, state, ActionKind::GetAddress, "[address] Get Ethereum address");
    invocation(&mut page, "Ethereum address", "Get address error", &state.get_address);
    page.push('\n');

    control(&mut page, state, ActionKind::SignTransaction, "[sign] Sign transaction");
    invocation(&mut page, "Signed transaction", "Sign transaction error", &state.sign_transaction);

    page
}

fn control(page: &mut String, state: &WorkshopState, kind: ActionKind, label: &str) {
    if state.can_start(kind) {
        line(page, label);
    } else if state.session_id.is_some() && !state.is_loading(kind) {
        line(page, &format!("{label} (device not ready)"));
    } else {
        line(page, &format!("{label} (disabled)"));
    }
}

fn invocation<O: Serialize>(page: &mut String, output: &str, error: &str, invocation: &Invocation<O>) {
    match invocation {
        Invocation::Idle => {
            line(page, &format!("{output}:"));
            line(page, "undefined");
        }
        Invocation::Loading(step) => {
            line(page, "Status:");
            match step {
                Some(step) => line(page, &pretty(step)),
                None => line(page, "loading"),
            }
        }
        Invocation::Completed(value) => {
            line(page, &format!("{output}:"));
            line(page, &pretty(value));
        }
        Invocation::Failed(err) => {
            line(page, &format!("{error}:"));
            line(page, &pretty(err));
        }
    }
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|err| format!("<unprintable: {err}>"))
}

fn line(page: &mut String, text: &str) {
    let _ = writeln!(page, "{text}");
}
