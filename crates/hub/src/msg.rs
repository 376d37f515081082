use std::any::Any;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::conn::Conn;
use crate::error::{Error, Result};

/// The central structure passed between connections.
///
/// The optional body is represented by raw bytes or typed, already-constructed
/// data. Exactly one of `raw`/`data` is expected to carry the body: `raw` wins
/// on the wire (it is what a transport actually sends), `data` wins in-process
/// (it lets a sender hand a controller an already-built value — e.g. an
/// `evt::Update` — without round-tripping it through JSON first).
///
/// `data` is type-erased because `hub` has no knowledge of `evt`'s types; callers
/// downcast with `data_ref`. There is deliberately no generic `Display`/wire
/// encoder for `data` — a transport (excluded from this crate's scope) that wants
/// to ship a typed in-process message over the wire must serialize it explicitly
/// before handing it to the transport.
pub struct Msg {
    /// The origin connection of this message, or `None` for server-internal messages.
    pub from: Option<Arc<dyn Conn>>,
    /// The required message header used for routing and determining the data type.
    pub subj: String,
    /// A client-chosen token that is echoed verbatim in replies.
    pub tok: String,
    /// The message body as bytes, usually JSON.
    pub raw: Option<Vec<u8>>,
    /// Typed in-process body, used to skip serialization for internal messages.
    pub data: Option<Box<dyn Any + Send + Sync>>,
}

impl Msg {
    pub fn new(subj: impl Into<String>) -> Self {
        Msg {
            from: None,
            subj: subj.into(),
            tok: String::new(),
            raw: None,
            data: None,
        }
    }

    pub fn with_data(subj: impl Into<String>, data: impl Any + Send + Sync) -> Self {
        Msg {
            from: None,
            subj: subj.into(),
            tok: String::new(),
            raw: None,
            data: Some(Box::new(data)),
        }
    }

    pub fn data_ref<T: Any>(&self) -> Option<&T> {
        self.data.as_ref().and_then(|d| d.downcast_ref::<T>())
    }

    /// Subjects starting with `_` are private and may only originate inside the
    /// process; an inbound private subject from a remote peer is a protocol violation.
    pub fn is_private(&self) -> bool {
        self.subj.starts_with('_')
    }

    /// Parses a wire frame (`<subject>[#<token>]\n<body>`) into a message.
    pub fn parse(s: &str) -> Result<Msg> {
        Self::read(s.as_bytes())
    }

    /// Parses input bytes into a message. The byte slice is consumed into `raw`.
    pub fn read(input: &[u8]) -> Result<Msg> {
        let mut subj = input;
        let mut raw = None;
        if let Some(idx) = subj.iter().position(|&b| b == b'\n') {
            raw = Some(subj[idx + 1..].to_vec());
            subj = &subj[..idx];
        }
        let mut tok = "";
        if let Some(idx) = subj.iter().position(|&b| b == b'#') {
            tok = std::str::from_utf8(&subj[idx + 1..])
                .map_err(|_| Error::InvalidFraming("token is not valid utf8".into()))?;
            subj = &subj[..idx];
        }
        if subj.is_empty() {
            return Err(Error::InvalidFraming("message without subject".into()));
        }
        let subj = std::str::from_utf8(subj)
            .map_err(|_| Error::InvalidFraming("subject is not valid utf8".into()))?
            .to_owned();
        Ok(Msg {
            from: None,
            subj,
            tok: tok.to_owned(),
            raw,
            data: None,
        })
    }

    /// Renders the wire frame for this message. Only meaningful when `raw` is set;
    /// a typed-only internal message has no wire representation (see type docs).
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = self.subj.clone().into_bytes();
        if !self.tok.is_empty() {
            out.push(b'#');
            out.extend_from_slice(self.tok.as_bytes());
        }
        out.push(b'\n');
        if let Some(raw) = &self.raw {
            out.extend_from_slice(raw);
        }
        out
    }

    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self
            .raw
            .as_deref()
            .ok_or_else(|| Error::MissingBody(self.subj.clone()))?;
        Ok(serde_json::from_slice(raw)?)
    }

    /// Parses this message's body as a `{res,err}` reply envelope, the shape
    /// produced by [`Msg::reply_res`]/[`Msg::reply_err`], yielding the decoded
    /// `res` or turning `err` into a [`Error::Transport`].
    pub fn parse_reply<T: DeserializeOwned>(&self) -> Result<T> {
        #[derive(Deserialize)]
        struct Envelope<T> {
            res: Option<T>,
            err: Option<String>,
        }
        let envelope: Envelope<T> = self.unmarshal()?;
        match envelope {
            Envelope { err: Some(err), .. } => Err(Error::Transport(err)),
            Envelope { res: Some(res), err: None } => Ok(res),
            Envelope { res: None, err: None } => Err(Error::MissingBody(self.subj.clone())),
        }
    }

    fn reply_raw(&self, raw: Vec<u8>) -> Msg {
        Msg {
            from: None,
            subj: self.subj.clone(),
            tok: self.tok.clone(),
            raw: Some(raw),
            data: None,
        }
    }

    pub fn reply<T: Serialize>(&self, data: &T) -> Result<Msg> {
        Ok(self.reply_raw(serde_json::to_vec(data)?))
    }

    /// Wraps `res` as the standard `{"res": ...}` envelope.
    pub fn reply_res<T: Serialize>(&self, res: &T) -> Result<Msg> {
        #[derive(Serialize)]
        struct Envelope<'a, T> {
            res: &'a T,
        }
        self.reply(&Envelope { res })
    }

    /// Wraps `err` as the standard `{"err": "..."}` envelope, omitting `res`.
    pub fn reply_err(&self, err: &str) -> Msg {
        #[derive(Serialize)]
        struct Envelope<'a> {
            err: &'a str,
        }
        // Encoding a string into an object literal cannot fail.
        self.reply_raw(serde_json::to_vec(&Envelope { err }).expect("infallible"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_parses_subject_token_and_body() {
        let m = Msg::read(b"evt.pub#abc\n{\"x\":1}").unwrap();
        assert_eq!(m.subj, "evt.pub");
        assert_eq!(m.tok, "abc");
        assert_eq!(m.raw.as_deref(), Some(&b"{\"x\":1}"[..]));
    }

    #[test]
    fn read_allows_missing_token_and_body() {
        let m = Msg::read(b"evt.sub").unwrap();
        assert_eq!(m.subj, "evt.sub");
        assert_eq!(m.tok, "");
        assert_eq!(m.raw, None);
    }

    #[test]
    fn read_rejects_empty_subject() {
        assert!(Msg::read(b"").is_err());
        assert!(Msg::read(b"#tok\nbody").is_err());
    }

    #[test]
    fn private_subject_detection() {
        assert!(Msg::new("_signon").is_private());
        assert!(!Msg::new("evt.pub").is_private());
    }

    #[test]
    fn reply_res_and_reply_err_envelopes() {
        let req = Msg::new("evt.unsub");
        let ok = req.reply_res(&true).unwrap();
        assert_eq!(ok.raw.as_deref(), Some(&br#"{"res":true}"#[..]));

        let err = req.reply_err("boom");
        assert_eq!(err.raw.as_deref(), Some(&br#"{"err":"boom"}"#[..]));
    }

    #[test]
    fn to_wire_roundtrips_through_read() {
        let mut m = Msg::new("evt.pub");
        m.tok = "42".into();
        m.raw = Some(b"{}".to_vec());
        let wire = m.to_wire();
        let parsed = Msg::read(&wire).unwrap();
        assert_eq!(parsed.subj, "evt.pub");
        assert_eq!(parsed.tok, "42");
        assert_eq!(parsed.raw.as_deref(), Some(&b"{}"[..]));
    }
}
