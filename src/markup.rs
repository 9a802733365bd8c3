//! Carrier control markup (§6 "Carrier control markup")
//!
//! A typed builder for the XML-ish TwiML-shaped response the webhook
//! handlers return to the carrier. Kept intentionally minimal — only the
//! elements §6 names — rather than a general-purpose XML document model.

use std::fmt::Write as _;

/// One instruction in a carrier response document.
#[derive(Debug, Clone)]
pub enum Directive {
    Play { url: String },
    Say { text: String, voice: String, language: String },
    Record {
        action_url: String,
        status_callback_url: String,
        max_length: u32,
        play_beep: bool,
        timeout: u32,
        finish_on_key: char,
    },
    Pause { length_secs: u32 },
    Redirect { url: String },
    Hangup,
}

/// An ordered sequence of [`Directive`]s, rendered as a single
/// `<Response>...</Response>` document.
#[derive(Debug, Clone, Default)]
pub struct MarkupResponse {
    directives: Vec<Directive>,
}

impl MarkupResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn play(mut self, url: impl Into<String>) -> Self {
        self.directives.push(Directive::Play { url: url.into() });
        self
    }

    pub fn say(mut self, text: impl Into<String>, voice: impl Into<String>, language: impl Into<String>) -> Self {
        self.directives.push(Directive::Say {
            text: text.into(),
            voice: voice.into(),
            language: language.into(),
        });
        self
    }

    /// §6 record directive defaults: `maxLength=300`, `playBeep=false`,
    /// `timeout=10`, `finishOnKey=#`.
    pub fn record(mut self, action_url: impl Into<String>, status_callback_url: impl Into<String>) -> Self {
        self.directives.push(Directive::Record {
            action_url: action_url.into(),
            status_callback_url: status_callback_url.into(),
            max_length: 300,
            play_beep: false,
            timeout: 10,
            finish_on_key: '#',
        });
        self
    }

    pub fn pause(mut self, length_secs: u32) -> Self {
        self.directives.push(Directive::Pause { length_secs });
        self
    }

    pub fn redirect(mut self, url: impl Into<String>) -> Self {
        self.directives.push(Directive::Redirect { url: url.into() });
        self
    }

    pub fn hangup(mut self) -> Self {
        self.directives.push(Directive::Hangup);
        self
    }

    /// Terminal error shape (§6 "On terminal error"):
    /// `<Say>{error-msg}</Say><Hangup/>`.
    pub fn error(message: impl Into<String>, voice: impl Into<String>, language: impl Into<String>) -> Self {
        Self::new().say(message, voice, language).hangup()
    }

    /// Wait shape (§6 "On wait"):
    /// `<Pause length="2"/><Redirect method="POST">{twiml-url}</Redirect>`.
    pub fn wait_and_redirect(twiml_url: impl Into<String>) -> Self {
        Self::new().pause(2).redirect(twiml_url)
    }

    pub fn render(&self) -> String {
        let mut out = String::from("<Response>\n");
        for directive in &self.directives {
            write_directive(&mut out, directive);
        }
        out.push_str("</Response>");
        out
    }
}

fn write_directive(out: &mut String, directive: &Directive) {
    match directive {
        Directive::Play { url } => {
            let _ = writeln!(out, "  <Play>{}</Play>", escape(url));
        }
        Directive::Say { text, voice, language } => {
            let _ = writeln!(
                out,
                "  <Say voice=\"{}\" language=\"{}\">{}</Say>",
                escape(voice),
                escape(language),
                escape(text)
            );
        }
        Directive::Record {
            action_url,
            status_callback_url,
            max_length,
            play_beep,
            timeout,
            finish_on_key,
        } => {
            let _ = writeln!(
                out,
                "  <Record action=\"{}\" recordingStatusCallback=\"{}\" method=\"POST\" \
                 maxLength=\"{}\" playBeep=\"{}\" timeout=\"{}\" finishOnKey=\"{}\"/>",
                escape(action_url),
                escape(status_callback_url),
                max_length,
                play_beep,
                timeout,
                finish_on_key
            );
        }
        Directive::Pause { length_secs } => {
            let _ = writeln!(out, "  <Pause length=\"{length_secs}\"/>");
        }
        Directive::Redirect { url } => {
            let _ = writeln!(out, "  <Redirect method=\"POST\">{}</Redirect>", escape(url));
        }
        Directive::Hangup => {
            out.push_str("  <Hangup/>\n");
        }
    }
}

/// Minimal XML text escaping; markup content is either vendor-controlled
/// URLs or agent-generated reply text, never raw user HTML.
fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_then_record_renders_expected_shape() {
        let doc = MarkupResponse::new()
            .play("https://host/audio/temp/abc.wav")
            .record("https://host/webhooks/recording/123", "https://host/webhooks/recording-status/123")
            .render();
        assert!(doc.contains("<Play>https://host/audio/temp/abc.wav</Play>"));
        assert!(doc.contains("maxLength=\"300\""));
        assert!(doc.contains("playBeep=\"false\""));
        assert!(doc.contains("finishOnKey=\"#\""));
    }

    #[test]
    fn error_shape_is_say_then_hangup() {
        let doc = MarkupResponse::error("Произошла ошибка", "alice", "ru-RU").render();
        assert!(doc.contains("<Say"));
        assert!(doc.contains("<Hangup/>"));
        let say_pos = doc.find("<Say").unwrap();
        let hangup_pos = doc.find("<Hangup/>").unwrap();
        assert!(say_pos < hangup_pos);
    }

    #[test]
    fn wait_shape_is_pause_then_redirect() {
        let doc = MarkupResponse::wait_and_redirect("https://host/webhooks/twiml/123").render();
        assert!(doc.contains("<Pause length=\"2\"/>"));
        assert!(doc.contains("<Redirect method=\"POST\">https://host/webhooks/twiml/123</Redirect>"));
    }

    #[test]
    fn text_is_escaped() {
        let doc = MarkupResponse::new().say("Tom & Jerry <test>", "alice", "ru-RU").render();
        assert!(doc.contains("Tom &amp; Jerry &lt;test&gt;"));
    }
}
