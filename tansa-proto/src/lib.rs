//! Tansa デバッガのコマンドプロトコル
//!
//! コントローラとの間で行区切りJSONのコマンド・応答・イベントをやり取りします。

pub mod codec;
pub mod dispatch;
pub mod message;
pub mod transport;

pub use codec::{decode, encode, write_message, MessageReader, ProtocolError, MAX_LINE_BYTES};
pub use dispatch::Dispatcher;
pub use message::{ErrorBody, Message, Request, Response, PROTOCOL_VERSION};
pub use transport::{connect, connect_and_serve, Outbox, ProtocolSession};
