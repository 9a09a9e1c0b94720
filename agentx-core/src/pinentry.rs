//! Minimal Assuan client for `pinentry`.
//!
//! The program is located the way GnuPG does it: an explicit path from the
//! config wins, then `pinentry-program` in `gpg-agent.conf`, then `pinentry`
//! on `PATH`.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::prompt::{PinDialog, PinPrompt, PinRequest, PromptError};

/// Low 16 bits of a GnuPG error code for "operation cancelled".
const GPG_ERR_CANCELED: u32 = 99;

#[derive(Debug, Clone)]
pub struct Pinentry {
    program: PathBuf,
    description: String,
    tty: Option<String>,
}

impl Pinentry {
    pub fn new(program: impl Into<PathBuf>, description: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            description: description.into(),
            tty: std::env::var("GPG_TTY").ok().filter(|t| !t.is_empty()),
        }
    }

    /// Resolve the pinentry program.  `explicit` comes from the config file.
    pub fn discover(explicit: Option<&Path>, description: impl Into<String>) -> Self {
        let program = explicit
            .map(Path::to_path_buf)
            .or_else(program_from_gpg_agent_conf)
            .unwrap_or_else(|| PathBuf::from("pinentry"));
        debug!(program = %program.display(), "pinentry program");
        Self::new(program, description)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl PinPrompt for Pinentry {
    fn request_pin(&self, request: &PinRequest) -> Result<Zeroizing<String>, PromptError> {
        let dialog = PinDialog::new(request, &self.description);

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| PromptError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PromptError::Protocol("pinentry stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PromptError::Protocol("pinentry stdout unavailable".into()))?;

        let mut session = AssuanSession::new(BufReader::new(stdout), stdin);
        let key_info = format!("--yubikey-id-{}", request.serial);
        let result = session.get_pin(&dialog, self.tty.as_deref(), &key_info);
        if let Err(e) = session.command("BYE") {
            debug!("pinentry BYE: {e}");
        }
        drop(session);

        if let Err(e) = child.wait() {
            warn!("waiting for pinentry failed: {e}");
        }
        result
    }
}

/// One Assuan conversation over a line-oriented reader/writer pair.
pub(crate) struct AssuanSession<R, W> {
    reader: R,
    writer: W,
    greeted: bool,
}

impl<R: BufRead, W: Write> AssuanSession<R, W> {
    pub(crate) fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            greeted: false,
        }
    }

    pub(crate) fn get_pin(
        &mut self,
        dialog: &PinDialog,
        tty: Option<&str>,
        key_info: &str,
    ) -> Result<Zeroizing<String>, PromptError> {
        if let Some(tty) = tty {
            self.option(&format!("ttyname={tty}"))?;
        }
        self.option("allow-external-password-cache")?;
        self.command(&format!("SETKEYINFO {}", escape(key_info)))?;
        self.command(&format!("SETTITLE {}", escape(&dialog.title)))?;
        self.command(&format!("SETDESC {}", escape(&dialog.description)))?;
        self.command(&format!("SETPROMPT {}", escape(&dialog.prompt)))?;

        let data = self.command("GETPIN")?;
        let pin = String::from_utf8(data.to_vec())
            .map_err(|_| PromptError::Protocol("PIN is not valid UTF-8".into()))?;
        Ok(Zeroizing::new(pin))
    }

    /// Unknown options are reported by old pinentry builds; they are not fatal.
    fn option(&mut self, option: &str) -> Result<(), PromptError> {
        match self.command(&format!("OPTION {option}")) {
            Ok(_) => Ok(()),
            Err(PromptError::Assuan { code, message }) => {
                debug!(option, code, %message, "pinentry rejected option");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send one command and collect any `D` lines up to the final `OK`.
    pub(crate) fn command(&mut self, line: &str) -> Result<Zeroizing<Vec<u8>>, PromptError> {
        if !self.greeted {
            self.read_response()?;
            self.greeted = true;
        }
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.read_response()
    }

    fn read_response(&mut self) -> Result<Zeroizing<Vec<u8>>, PromptError> {
        let mut data = Zeroizing::new(Vec::new());
        loop {
            let mut line = Zeroizing::new(String::new());
            if self.reader.read_line(&mut line)? == 0 {
                return Err(PromptError::Protocol("unexpected end of output".into()));
            }
            let line = line.trim_end_matches(['\r', '\n']);

            if line == "OK" || line.starts_with("OK ") {
                return Ok(data);
            }
            if let Some(rest) = line.strip_prefix("ERR ") {
                let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
                let code: u32 = code
                    .parse()
                    .map_err(|_| PromptError::Protocol(format!("bad error line: {line}")))?;
                if code & 0xffff == GPG_ERR_CANCELED {
                    return Err(PromptError::Cancelled);
                }
                return Err(PromptError::Assuan {
                    code,
                    message: message.to_string(),
                });
            }
            if let Some(payload) = line.strip_prefix("D ") {
                data.extend_from_slice(&unescape(payload));
                continue;
            }
            if line.starts_with('#') || line.starts_with("S ") || line == "S" {
                continue;
            }
            return Err(PromptError::Protocol(format!("unexpected line: {line}")));
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(value: &str) -> Zeroizing<Vec<u8>> {
    let bytes = value.as_bytes();
    let mut out = Zeroizing::new(Vec::with_capacity(bytes.len()));
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn program_from_gpg_agent_conf() -> Option<PathBuf> {
    let home = std::env::var_os("GNUPGHOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".gnupg")))?;
    let content = std::fs::read_to_string(home.join("gpg-agent.conf")).ok()?;
    parse_pinentry_program(&content)
}

fn parse_pinentry_program(conf: &str) -> Option<PathBuf> {
    conf.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.strip_prefix("pinentry-program"))
        .filter(|rest| rest.starts_with([' ', '\t']))
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(PathBuf::from)
}
