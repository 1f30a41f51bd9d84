//! Dialplan applications run on a parked call through `sendmsg execute`.

use crate::constants::DEFAULT_HANGUP_CAUSE;

/// One dialplan application with its argument string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCommand {
    app: String,
    args: String,
}

impl AppCommand {
    /// Any application by name.
    pub fn new(app: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            args: args.into(),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn answer() -> Self {
        Self::new("answer", "")
    }

    pub fn pre_answer() -> Self {
        Self::new("pre_answer", "")
    }

    /// `hangup` with the given cause, `NORMAL_CLEARING` when none.
    pub fn hangup(cause: Option<&str>) -> Self {
        Self::new("hangup", cause.unwrap_or(DEFAULT_HANGUP_CAUSE))
    }

    pub fn playback(path: &str) -> Self {
        Self::new("playback", path)
    }

    /// `set name=value` on the channel.
    pub fn set(name: &str, value: &str) -> Self {
        Self::new("set", format!("{}={}", name, value))
    }

    pub fn unset(name: &str) -> Self {
        Self::new("unset", name)
    }

    /// Several variables at once, using the `^^:` custom delimiter form.
    pub fn multiset<K, V>(vars: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut args = String::from("^^");
        for (name, value) in vars {
            args.push(':');
            args.push_str(name.as_ref());
            args.push('=');
            args.push_str(value.as_ref());
        }
        Self::new("multiset", args)
    }

    pub fn multiunset<N: AsRef<str>>(names: &[N]) -> Self {
        let mut args = String::from("^^");
        for name in names {
            args.push(':');
            args.push_str(name.as_ref());
        }
        Self::new("multiunset", args)
    }

    /// Bridge to a dial string, e.g. `sofia/gateway/gw/1000`.
    pub fn bridge(dial_string: &str) -> Self {
        Self::new("bridge", dial_string)
    }

    pub fn voicemail(profile: &str, domain: &str, user: &str) -> Self {
        Self::new("voicemail", format!("{} {} {}", profile, domain, user))
    }

    /// Fire a custom event from the channel. Headers are comma separated
    /// `name=value` pairs, `Event-Subclass` among them for `CUSTOM`.
    pub fn event<K, V>(headers: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let args = headers
            .iter()
            .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
            .collect::<Vec<_>>()
            .join(",");
        Self::new("event", args)
    }

    pub fn play_and_get_digits(params: &PlayAndGetDigits) -> Self {
        Self::new("play_and_get_digits", params.to_string())
    }

    /// `sendmsg` headers that run this application.
    ///
    /// `event_uuid` comes back as `Application-UUID` on the matching
    /// `CHANNEL_EXECUTE_COMPLETE`.
    pub(crate) fn execute_headers<'a>(&'a self, event_uuid: &'a str) -> [(&'a str, &'a str); 4] {
        [
            ("call-command", "execute"),
            ("execute-app-name", self.app.as_str()),
            ("execute-app-arg", self.args.as_str()),
            ("Event-UUID", event_uuid),
        ]
    }
}

impl std::fmt::Display for AppCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self
            .args
            .is_empty()
        {
            f.write_str(&self.app)
        } else {
            write!(f, "{} {}", self.app, self.args)
        }
    }
}

/// Arguments of `play_and_get_digits`, in positional order.
///
/// Empty string arguments are sent as `''` so positions never shift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayAndGetDigits {
    pub min_digits: u32,
    pub max_digits: u32,
    pub tries: u32,
    /// Milliseconds to wait for the first digit after the prompt.
    pub timeout_ms: u64,
    pub terminators: String,
    pub file: String,
    pub invalid_file: String,
    /// Channel variable the digits are stored in.
    pub var_name: String,
    pub regexp: String,
    /// Milliseconds allowed between digits.
    pub digit_timeout_ms: u64,
    /// Dialplan target on final failure, e.g. `1000 XML default`.
    pub transfer_on_failure: String,
}

impl PlayAndGetDigits {
    /// Single digit, three tries, five second timeouts, `#` terminates.
    pub fn one_digit(file: &str, var_name: &str) -> Self {
        Self {
            min_digits: 1,
            max_digits: 1,
            tries: 3,
            timeout_ms: 5000,
            terminators: "#".to_string(),
            file: file.to_string(),
            invalid_file: String::new(),
            var_name: var_name.to_string(),
            regexp: "\\d".to_string(),
            digit_timeout_ms: 5000,
            transfer_on_failure: String::new(),
        }
    }
}

fn positional(value: &str) -> &str {
    if value.is_empty() {
        "''"
    } else {
        value
    }
}

impl std::fmt::Display for PlayAndGetDigits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {} {} {} {} {}",
            self.min_digits,
            self.max_digits,
            self.tries,
            self.timeout_ms,
            positional(&self.terminators),
            positional(&self.file),
            positional(&self.invalid_file),
            positional(&self.var_name),
            positional(&self.regexp),
            self.digit_timeout_ms,
            positional(&self.transfer_on_failure),
        )
    }
}
