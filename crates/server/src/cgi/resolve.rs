//! Locating and vetting the script of a CGI request.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{RouteConfig, ServerConfig};
use crate::error::CgiError;
use crate::handler::path;

/// How the script is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// The script is executed directly.
    Direct,
    /// The script is passed to an interpreter, with optional extra argument.
    Interpreter { program: PathBuf, arg: Option<String> },
}

/// A script that passed every check and can be spawned.
#[derive(Debug, Clone)]
pub struct Script {
    /// Canonical path of the script file.
    pub path: PathBuf,
    /// Directory the child runs in.
    pub working_dir: PathBuf,
    /// Request path of the script itself.
    pub script_name: String,
    /// What follows the script in the request path.
    pub path_info: String,
    pub launcher: Launcher,
}

/// Splits a decoded request path at the first segment with a CGI extension of `route`.
///
/// Returns the script part and the remainder, which becomes `PATH_INFO`.
pub fn split_script_path<'p>(route: &RouteConfig, path: &'p str) -> Option<(&'p str, &'p str)> {
    let mut offset = 0;
    for segment in path.split('/') {
        let end = offset + segment.len();
        if !segment.is_empty() && route.is_cgi_extension(segment) {
            return Some(path.split_at(end));
        }
        offset = end + 1;
    }
    None
}

/// Resolves and checks the script a request path names.
pub fn resolve(server: &ServerConfig, route: &RouteConfig, path: &str) -> Result<Script, CgiError> {
    let (script_name, path_info) = split_script_path(route, path).ok_or(CgiError::NotFound)?;
    let (cgi_root, relative) = server.cgi_root(route, script_name);

    let candidate = path::resolve(cgi_root, relative).ok_or(CgiError::Forbidden)?;
    let root = fs::canonicalize(cgi_root).map_err(|e| {
        debug!(cause = %e, root = %cgi_root.display(), "cgi directory is not accessible");
        CgiError::NotFound
    })?;
    let script = fs::canonicalize(&candidate).map_err(|_| CgiError::NotFound)?;

    if !script.starts_with(&root) {
        return Err(CgiError::Forbidden);
    }

    let metadata = fs::metadata(&script).map_err(|_| CgiError::NotFound)?;
    if !metadata.is_file() {
        return Err(CgiError::NotFound);
    }

    let file = File::open(&script).map_err(|source| CgiError::Unreadable { source })?;

    let segment = script_name.rsplit('/').next().unwrap_or_default();
    let launcher = match route.cgi_interpreter(segment).flatten() {
        Some(interpreter) => {
            if !is_executable_file(interpreter) {
                return Err(CgiError::BadInterpreter { path: interpreter.to_path_buf() });
            }
            Launcher::Interpreter { program: interpreter.to_path_buf(), arg: None }
        }
        None if is_executable(&metadata) => Launcher::Direct,
        None => read_shebang(file).ok_or(CgiError::NotExecutable)?,
    };

    let working_dir = script.parent().map_or_else(|| root.clone(), Path::to_path_buf);
    Ok(Script {
        path: script,
        working_dir,
        script_name: script_name.to_owned(),
        path_info: path_info.to_owned(),
        launcher,
    })
}

fn is_executable(metadata: &fs::Metadata) -> bool {
    metadata.permissions().mode() & 0o111 != 0
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|metadata| metadata.is_file() && is_executable(&metadata))
}

/// Interpreter named by a `#!` line, for scripts without the executable bit.
fn read_shebang(file: File) -> Option<Launcher> {
    // the first line only, bounded so a binary file is not read whole
    let mut first = Vec::new();
    BufReader::new(file).take(512).read_until(b'\n', &mut first).ok()?;
    let line = String::from_utf8_lossy(&first);

    let command = line.strip_prefix("#!")?.trim();
    let (program, arg) = match command.split_once(char::is_whitespace) {
        Some((program, arg)) => (program, Some(arg.trim().to_owned())),
        None => (command, None),
    };

    if program.is_empty() || !is_executable_file(Path::new(program)) {
        return None;
    }
    Some(Launcher::Interpreter { program: PathBuf::from(program), arg })
}
