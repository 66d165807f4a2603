//! The extension set advertised on EHLO.
//!
//! The advertised list is a pure function of static configuration plus the
//! session's current TLS/auth state: STARTTLS disappears once TLS is active,
//! AUTH appears only when it may actually be used.

use crate::config::SmtpConfig;

/// Per-connection view of what the session may negotiate.
#[derive(Debug, Clone, Copy)]
pub struct SessionCapabilities {
    pub tls_available: bool,
    pub tls_active: bool,
    pub auth_available: bool,
    pub authenticated: bool,
}

/// Extension tokens for the EHLO reply, one per line.
pub fn advertised(config: &SmtpConfig, caps: SessionCapabilities) -> Vec<String> {
    let mut extensions = vec![
        "PIPELINING".to_string(),
        format!("SIZE {}", config.max_message_size),
        "8BITMIME".to_string(),
        "SMTPUTF8".to_string(),
        "CHUNKING".to_string(),
        "DSN".to_string(),
        "ENHANCEDSTATUSCODES".to_string(),
    ];

    if caps.tls_available && !caps.tls_active {
        extensions.push("STARTTLS".to_string());
    }

    let auth_usable = caps.auth_available
        && !caps.authenticated
        && (caps.tls_active || !config.require_tls_for_auth);
    if auth_usable {
        extensions.push("AUTH PLAIN LOGIN".to_string());
    }

    extensions.push("HELP".to_string());
    extensions
}
