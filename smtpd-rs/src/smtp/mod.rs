//! SMTP protocol engine: codec, command grammar, extension set, session
//! state machine, transaction staging and the connection supervisor.

pub mod codec;
pub mod command;
pub mod extensions;
pub mod server;
pub mod session;
pub mod transaction;

pub use codec::{Reply, SmtpConnection, SmtpStream};
pub use command::{Address, Command, MailParams, ReversePath};
pub use server::SmtpServer;
pub use session::{Session, SessionHandles};
pub use transaction::{CommittedMessage, Transaction};
