use zeroize::Zeroizing;

pub const PIN_TITLE: &str = "ssh-agentx yubikey PIN Prompt";
pub const PIN_PROMPT: &str = "Please enter your PIN:";

/// What the token asks for when it needs a PIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinRequest {
    pub serial: u32,
    pub retries: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("PIN entry cancelled")]
    Cancelled,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pinentry i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("pinentry error {code}: {message}")]
    Assuan { code: u32, message: String },
    #[error("pinentry protocol: {0}")]
    Protocol(String),
}

/// Collects a PIN from the user.  Implementations block until the user
/// answers; callers run them off the async executor.
pub trait PinPrompt: Send + Sync {
    fn request_pin(&self, request: &PinRequest) -> Result<Zeroizing<String>, PromptError>;
}

/// Title, description and prompt shown by the PIN dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinDialog {
    pub title: String,
    pub description: String,
    pub prompt: String,
}

impl PinDialog {
    pub fn new(request: &PinRequest, description_template: &str) -> Self {
        Self {
            title: PIN_TITLE.to_string(),
            description: describe_pin(description_template, request),
            prompt: PIN_PROMPT.to_string(),
        }
    }
}

/// Fill `{{serial}}` and `{{retries}}` in a PIN description.  Any other
/// text, unknown or unterminated placeholders included, is kept as written.
pub fn describe_pin(template: &str, request: &PinRequest) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let inner = &rest[open + 2..];
        let Some(close) = inner.find("}}") else {
            rest = &rest[open..];
            break;
        };
        match inner[..close].trim() {
            "serial" => out.push_str(&request.serial.to_string()),
            "retries" => out.push_str(&request.retries.to_string()),
            _ => out.push_str(&rest[open..open + close + 4]),
        }
        rest = &inner[close + 2..];
    }
    out.push_str(rest);
    out
}
