//! SMTP command parsing per RFC 5321.
//!
//! Keywords are case-insensitive; trailing whitespace is trimmed. MAIL and
//! RCPT enforce angle-bracketed paths and understand `key=value` extension
//! parameters. Source routes are parsed and discarded.

use crate::error::{Result, SmtpError};

/// Maximum octets in a mailbox local-part.
pub const MAX_LOCAL_PART: usize = 64;
/// Maximum octets in a domain.
pub const MAX_DOMAIN: usize = 255;

/// A mailbox address split into its semantic parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub local: String,
    pub domain: String,
}

impl Address {
    /// Parse `local@domain` (no angle brackets). UTF-8 is accepted here;
    /// the session rejects non-ASCII addresses unless SMTPUTF8 was declared.
    pub fn parse(raw: &str) -> Result<Self> {
        let at = raw
            .rfind('@')
            .ok_or_else(|| SmtpError::Parameter(format!("address without domain: {raw}")))?;
        let (local, domain) = (&raw[..at], &raw[at + 1..]);

        if local.is_empty() || local.len() > MAX_LOCAL_PART {
            return Err(SmtpError::Parameter(format!("bad local part: {raw}")));
        }
        if local.chars().any(|c| c.is_control() || c == ' ' || c == '<' || c == '>') {
            return Err(SmtpError::Parameter(format!("bad local part: {raw}")));
        }

        if domain.is_empty() || domain.len() > MAX_DOMAIN {
            return Err(SmtpError::Parameter(format!("bad domain: {raw}")));
        }
        // Address literals ([192.0.2.1]) skip label checks.
        if !(domain.starts_with('[') && domain.ends_with(']')) {
            for label in domain.split('.') {
                let ok = !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '-' || !c.is_ascii());
                if !ok {
                    return Err(SmtpError::Parameter(format!("bad domain: {raw}")));
                }
            }
        }

        Ok(Self {
            local: local.to_string(),
            domain: domain.to_string(),
        })
    }

    pub fn is_ascii(&self) -> bool {
        self.local.is_ascii() && self.domain.is_ascii()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// The MAIL FROM path. `<>` is the distinguished null sender used by
/// delivery status notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    Null,
    Mailbox(Address),
}

impl ReversePath {
    pub fn is_ascii(&self) -> bool {
        match self {
            ReversePath::Null => true,
            ReversePath::Mailbox(a) => a.is_ascii(),
        }
    }
}

impl std::fmt::Display for ReversePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReversePath::Null => Ok(()),
            ReversePath::Mailbox(a) => write!(f, "{a}"),
        }
    }
}

/// Extension parameters recognised on MAIL FROM.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MailParams {
    pub size: Option<u64>,
    pub body_8bit: bool,
    pub smtputf8: bool,
    /// Accepted but otherwise uninterpreted parameters (DSN RET/ENVID etc.)
    pub other: Vec<(String, Option<String>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    Mail {
        reverse_path: ReversePath,
        params: MailParams,
    },
    Rcpt {
        forward_path: Address,
        params: Vec<(String, Option<String>)>,
    },
    Data,
    Bdat {
        size: u64,
        last: bool,
    },
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Expn(String),
    Help,
    Starttls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return Err(SmtpError::Syntax("empty command".to_string()));
        }

        let (keyword, args) = match line.find(' ') {
            Some(i) => (&line[..i], line[i + 1..].trim()),
            None => (line, ""),
        };

        match keyword.to_uppercase().as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(SmtpError::Parameter("HELO requires a domain".to_string()));
                }
                Ok(Command::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(SmtpError::Parameter("EHLO requires a domain".to_string()));
                }
                Ok(Command::Ehlo(args.to_string()))
            }
            "MAIL" => parse_mail(args),
            "RCPT" => parse_rcpt(args),
            "DATA" => Ok(Command::Data),
            "BDAT" => parse_bdat(args),
            "RSET" => Ok(Command::Rset),
            "NOOP" => Ok(Command::Noop),
            "QUIT" => Ok(Command::Quit),
            "VRFY" => {
                if args.is_empty() {
                    return Err(SmtpError::Parameter("VRFY requires an argument".to_string()));
                }
                Ok(Command::Vrfy(args.to_string()))
            }
            "EXPN" => {
                if args.is_empty() {
                    return Err(SmtpError::Parameter("EXPN requires an argument".to_string()));
                }
                Ok(Command::Expn(args.to_string()))
            }
            "HELP" => Ok(Command::Help),
            "STARTTLS" => Ok(Command::Starttls),
            "AUTH" => {
                if args.is_empty() {
                    return Err(SmtpError::Parameter("AUTH requires a mechanism".to_string()));
                }
                let mut parts = args.splitn(2, ' ');
                let mechanism = parts.next().unwrap_or_default().to_string();
                let initial = parts.next().map(|s| s.trim().to_string());
                Ok(Command::Auth { mechanism, initial })
            }
            other => Ok(Command::Unknown(other.to_string())),
        }
    }
}

/// Extract the bracketed path from `FROM:<...>` / `TO:<...>` arguments and
/// return it alongside the trailing parameter text.
fn split_path_args<'a>(args: &'a str, prefix: &str) -> Result<(&'a str, &'a str)> {
    let head = args.get(..prefix.len());
    if !head.is_some_and(|h| h.eq_ignore_ascii_case(prefix)) {
        return Err(SmtpError::Syntax(format!("expected {prefix}<path>")));
    }
    let rest = args[prefix.len()..].trim_start();

    // Angle brackets are mandatory on MAIL FROM and RCPT TO.
    if !rest.starts_with('<') {
        return Err(SmtpError::Parameter("path must be enclosed in <>".to_string()));
    }
    let close = rest
        .find('>')
        .ok_or_else(|| SmtpError::Parameter("unterminated path".to_string()))?;

    Ok((&rest[1..close], rest[close + 1..].trim()))
}

/// Drop a leading source route (`@relay1,@relay2:`) from a path.
fn strip_source_route(path: &str) -> &str {
    if path.starts_with('@') {
        if let Some(colon) = path.find(':') {
            return &path[colon + 1..];
        }
    }
    path
}

fn parse_params(text: &str) -> Vec<(String, Option<String>)> {
    text.split_whitespace()
        .map(|token| match token.split_once('=') {
            Some((k, v)) => (k.to_uppercase(), Some(v.to_string())),
            None => (token.to_uppercase(), None),
        })
        .collect()
}

fn parse_mail(args: &str) -> Result<Command> {
    let (path, param_text) = split_path_args(args, "FROM:")?;

    let reverse_path = if path.is_empty() {
        ReversePath::Null
    } else {
        ReversePath::Mailbox(Address::parse(strip_source_route(path))?)
    };

    let mut params = MailParams::default();
    for (key, value) in parse_params(param_text) {
        match (key.as_str(), value) {
            ("SIZE", Some(v)) => {
                let size = v
                    .parse::<u64>()
                    .map_err(|_| SmtpError::Parameter(format!("bad SIZE value: {v}")))?;
                params.size = Some(size);
            }
            ("SIZE", None) => {
                return Err(SmtpError::Parameter("SIZE requires a value".to_string()));
            }
            ("BODY", Some(v)) => match v.to_uppercase().as_str() {
                "8BITMIME" => params.body_8bit = true,
                "7BIT" => params.body_8bit = false,
                other => {
                    return Err(SmtpError::Parameter(format!("bad BODY value: {other}")));
                }
            },
            ("BODY", None) => {
                return Err(SmtpError::Parameter("BODY requires a value".to_string()));
            }
            ("SMTPUTF8", None) => params.smtputf8 = true,
            ("SMTPUTF8", Some(_)) => {
                return Err(SmtpError::Parameter("SMTPUTF8 takes no value".to_string()));
            }
            (_, value) => params.other.push((key, value)),
        }
    }

    Ok(Command::Mail { reverse_path, params })
}

fn parse_rcpt(args: &str) -> Result<Command> {
    let (path, param_text) = split_path_args(args, "TO:")?;

    if path.is_empty() {
        return Err(SmtpError::Parameter("empty forward path".to_string()));
    }
    let forward_path = Address::parse(strip_source_route(path))?;

    Ok(Command::Rcpt {
        forward_path,
        params: parse_params(param_text),
    })
}

fn parse_bdat(args: &str) -> Result<Command> {
    let mut parts = args.split_whitespace();
    let size_text = parts
        .next()
        .ok_or_else(|| SmtpError::Parameter("BDAT requires a chunk size".to_string()))?;
    let size = size_text
        .parse::<u64>()
        .map_err(|_| SmtpError::Parameter(format!("bad BDAT size: {size_text}")))?;

    let last = match parts.next() {
        None => false,
        Some(word) if word.eq_ignore_ascii_case("LAST") => true,
        Some(other) => {
            return Err(SmtpError::Parameter(format!("bad BDAT argument: {other}")));
        }
    };
    if parts.next().is_some() {
        return Err(SmtpError::Parameter("too many BDAT arguments".to_string()));
    }

    Ok(Command::Bdat { size, last })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn test_parse_helo() {
        let cmd = Command::parse("HELO example.com").unwrap();
        assert_eq!(cmd, Command::Helo("example.com".to_string()));
    }

    #[test]
    fn test_parse_keyword_case_insensitive() {
        let cmd = Command::parse("ehlo client.example.com").unwrap();
        assert_eq!(cmd, Command::Ehlo("client.example.com".to_string()));
    }

    #[test]
    fn test_parse_mail_from() {
        let cmd = Command::parse("MAIL FROM:<sender@example.com>").unwrap();
        assert_eq!(
            cmd,
            Command::Mail {
                reverse_path: ReversePath::Mailbox(addr("sender@example.com")),
                params: MailParams::default(),
            }
        );
    }

    #[test]
    fn test_parse_mail_from_null_sender() {
        let cmd = Command::parse("MAIL FROM:<>").unwrap();
        assert_eq!(
            cmd,
            Command::Mail {
                reverse_path: ReversePath::Null,
                params: MailParams::default(),
            }
        );
    }

    #[test]
    fn test_mail_from_requires_brackets() {
        assert!(Command::parse("MAIL FROM:sender@example.com").is_err());
    }

    #[test]
    fn test_parse_mail_from_with_size() {
        let cmd = Command::parse("MAIL FROM:<a@x.org> SIZE=2000").unwrap();
        match cmd {
            Command::Mail { params, .. } => assert_eq!(params.size, Some(2000)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_mail_from_with_body_and_utf8() {
        let cmd = Command::parse("MAIL FROM:<a@x.org> BODY=8BITMIME SMTPUTF8").unwrap();
        match cmd {
            Command::Mail { params, .. } => {
                assert!(params.body_8bit);
                assert!(params.smtputf8);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_mail_bad_size_value() {
        assert!(Command::parse("MAIL FROM:<a@x.org> SIZE=huge").is_err());
    }

    #[test]
    fn test_source_route_discarded() {
        let cmd = Command::parse("MAIL FROM:<@relay.example,@hop.example:real@example.com>").unwrap();
        assert_eq!(
            cmd,
            Command::Mail {
                reverse_path: ReversePath::Mailbox(addr("real@example.com")),
                params: MailParams::default(),
            }
        );
    }

    #[test]
    fn test_parse_rcpt_to() {
        let cmd = Command::parse("RCPT TO:<recipient@example.com>").unwrap();
        assert_eq!(
            cmd,
            Command::Rcpt {
                forward_path: addr("recipient@example.com"),
                params: vec![],
            }
        );
    }

    #[test]
    fn test_rcpt_rejects_null_path() {
        assert!(Command::parse("RCPT TO:<>").is_err());
    }

    #[test]
    fn test_parse_rcpt_with_dsn_params() {
        let cmd = Command::parse("RCPT TO:<b@y.org> NOTIFY=SUCCESS,FAILURE").unwrap();
        match cmd {
            Command::Rcpt { params, .. } => {
                assert_eq!(params, vec![("NOTIFY".to_string(), Some("SUCCESS,FAILURE".to_string()))]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_bdat() {
        assert_eq!(
            Command::parse("BDAT 1024").unwrap(),
            Command::Bdat { size: 1024, last: false }
        );
        assert_eq!(
            Command::parse("BDAT 0 LAST").unwrap(),
            Command::Bdat { size: 0, last: true }
        );
        assert!(Command::parse("BDAT").is_err());
        assert!(Command::parse("BDAT twelve").is_err());
        assert!(Command::parse("BDAT 5 FIRST").is_err());
    }

    #[test]
    fn test_parse_auth() {
        assert_eq!(
            Command::parse("AUTH PLAIN AGZvbwBiYXI=").unwrap(),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("AGZvbwBiYXI=".to_string()),
            }
        );
        assert_eq!(
            Command::parse("AUTH LOGIN").unwrap(),
            Command::Auth {
                mechanism: "LOGIN".to_string(),
                initial: None,
            }
        );
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse("DATA").unwrap(), Command::Data);
        assert_eq!(Command::parse("RSET").unwrap(), Command::Rset);
        assert_eq!(Command::parse("QUIT").unwrap(), Command::Quit);
        assert_eq!(Command::parse("NOOP").unwrap(), Command::Noop);
        assert_eq!(Command::parse("HELP").unwrap(), Command::Help);
        assert_eq!(Command::parse("STARTTLS").unwrap(), Command::Starttls);
    }

    #[test]
    fn test_parse_vrfy_always_has_argument() {
        assert_eq!(
            Command::parse("VRFY postmaster").unwrap(),
            Command::Vrfy("postmaster".to_string())
        );
        assert!(Command::parse("VRFY").is_err());
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(
            Command::parse("ETRN example.com").unwrap(),
            Command::Unknown("ETRN".to_string())
        );
    }

    #[test]
    fn test_parse_empty_line_is_syntax_error() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("   ").is_err());
    }

    #[test]
    fn test_address_limits() {
        let long_local = "a".repeat(MAX_LOCAL_PART + 1);
        assert!(Address::parse(&format!("{long_local}@x.org")).is_err());
        assert!(Address::parse("@x.org").is_err());
        assert!(Address::parse("user@").is_err());
        assert!(Address::parse("user").is_err());
        assert!(Address::parse("user@-bad.org").is_err());
    }

    #[test]
    fn test_address_literal_domain() {
        let a = Address::parse("user@[192.0.2.1]").unwrap();
        assert_eq!(a.domain, "[192.0.2.1]");
    }

    #[test]
    fn test_utf8_address_accepted_by_parser() {
        let a = Address::parse("ünïcode@exämple.org").unwrap();
        assert!(!a.is_ascii());
    }
}
