//! Wire vocabulary shared by the chat server and its clients.
//!
//! Client → server lines are `[!]name arg1 ... argN`. Server → client
//! notifications reuse the marked form (`!send`, `!register`). The direct
//! peer exchange is one `<sender>: <message>` line answered by [`ACK`].

use chrono::Local;

/// Optional leading marker on command lines.
pub const MARKER: char = '!';

/// Acknowledgement token of the direct peer exchange.
pub const ACK: &str = "!ack";

/// Payload of a discovery datagram.
pub const LIST_QUERY: &str = "!list";

/// Receive buffer for discovery datagrams; longer payloads are truncated.
pub const UDP_BUFFER_SIZE: usize = 1024;

pub const LOGIN_REQUIRED: &str = "You have to log in!";
pub const ALREADY_LOGGED_IN: &str = "You are already logged in!";
pub const LOGIN_SUCCESS: &str = "Successfully logged in.";
pub const LOGIN_FAILED: &str = "Wrong username or password.";
pub const LOGOUT_SUCCESS: &str = "Successfully logged out.";
pub const REGISTER_SUCCESS: &str = "Successfully registered private IP address.";
pub const NO_MESSAGE_YET: &str = "No message received yet!";

/// Builds a marked wire line: `!name arg1 arg2 ...`.
pub fn wire_line(command: &str, args: &[&str]) -> String {
    let mut line = String::with_capacity(command.len() + 1);
    line.push(MARKER);
    line.push_str(command);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Public-message notification relayed to every other authenticated session.
pub fn send_notification(username: &str, message: &str) -> String {
    wire_line("send", &[username, message])
}

/// Address-resolution notification answering a successful `lookup`.
pub fn register_notification(username: &str, address: &str) -> String {
    wire_line("register", &[username, address])
}

pub fn not_registered(username: &str) -> String {
    format!("{username} didn't register yet!")
}

pub fn user_not_found(username: &str) -> String {
    format!("No user with name {username} found.")
}

/// Request line of the direct peer exchange.
pub fn peer_line(sender: &str, message: &str) -> String {
    format!("{sender}: {message}")
}

/// Wall-clock time as `HH:MM:SS.mmm`, the stamp used for shell echoes and
/// deferred messages.
pub fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}
