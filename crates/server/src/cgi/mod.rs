//! CGI/1.1 gateway.
//!
//! A CGI request goes through three steps: [`resolve`] finds and vets the script,
//! [`spawn`] starts it with its environment and pipes, and the resulting [`CgiSession`]
//! is driven by the connection until the [`OutputParser`] saw the end of the response.

mod env;
mod output;
mod resolve;
mod session;

pub use env::{CgiRequest, build_env, strip_port};
pub use output::{MAX_CGI_HEADER_BYTES, OutputEvent, OutputParser};
pub use resolve::{Launcher, Script, resolve, split_script_path};
pub use session::{CgiSession, PAUSE_ABOVE, PipeEnd, RESUME_BELOW, spawn};
