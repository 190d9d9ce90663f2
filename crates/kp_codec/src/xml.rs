use kp_core::app_error::{AppError, AppResult};

fn malformed(message: &str, at: usize) -> AppError {
    AppError::new(
        "KP_BLOB_CORRUPT",
        "codec",
        message,
        false,
        serde_json::json!({ "offset": at }),
    )
}

pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_text(raw: &str, at: usize) -> AppResult<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.char_indices();
    while let Some((idx, c)) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let rest = &raw[idx + 1..];
        let end = rest
            .find(';')
            .ok_or_else(|| malformed("unterminated character entity", at + idx))?;
        let entity = &rest[..end];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                let c = code
                    .and_then(char::from_u32)
                    .ok_or_else(|| malformed("unknown character entity", at + idx))?;
                out.push(c);
            }
        }
        for _ in 0..end + 1 {
            chars.next();
        }
    }
    Ok(out)
}

/// Serializer for the KeePass document. Emits no indentation; leaf values
/// are escaped, attribute values too.
pub struct XmlWriter {
    out: String,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self {
            out: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>"),
        }
    }

    pub fn open(&mut self, name: &str) {
        self.out.push('<');
        self.out.push_str(name);
        self.out.push('>');
    }

    pub fn close(&mut self, name: &str) {
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push('>');
    }

    pub fn leaf(&mut self, name: &str, text: &str) {
        self.open(name);
        self.out.push_str(&escape_text(text));
        self.close(name);
    }

    pub fn leaf_with_attr(&mut self, name: &str, attr: &str, attr_value: &str, text: &str) {
        self.out.push('<');
        self.out.push_str(name);
        self.out.push(' ');
        self.out.push_str(attr);
        self.out.push_str("=\"");
        self.out.push_str(&escape_text(attr_value));
        self.out.push_str("\">");
        self.out.push_str(&escape_text(text));
        self.close(name);
    }

    pub fn finish(self) -> String {
        self.out
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum XmlEvent {
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End(String),
    Text(String),
}

/// Pull parser covering the XML subset the KeePass document uses: elements,
/// attributes, text, entities, comments and the prolog. No namespaces, no
/// CDATA, no DTDs.
pub struct XmlReader<'a> {
    input: &'a str,
    pos: usize,
    pending_end: Option<String>,
}

impl<'a> XmlReader<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            pending_end: None,
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    pub fn next_event(&mut self) -> AppResult<Option<XmlEvent>> {
        if let Some(name) = self.pending_end.take() {
            return Ok(Some(XmlEvent::End(name)));
        }

        loop {
            if self.pos >= self.input.len() {
                return Ok(None);
            }

            if !self.rest().starts_with('<') {
                let end = self.rest().find('<').unwrap_or(self.rest().len());
                let raw = &self.input[self.pos..self.pos + end];
                let at = self.pos;
                self.pos += end;
                return Ok(Some(XmlEvent::Text(unescape_text(raw, at)?)));
            }

            if self.rest().starts_with("<?") {
                let end = self
                    .rest()
                    .find("?>")
                    .ok_or_else(|| malformed("unterminated processing instruction", self.pos))?;
                self.pos += end + 2;
                continue;
            }
            if self.rest().starts_with("<!--") {
                let end = self
                    .rest()
                    .find("-->")
                    .ok_or_else(|| malformed("unterminated comment", self.pos))?;
                self.pos += end + 3;
                continue;
            }
            if self.rest().starts_with("</") {
                let end = self
                    .rest()
                    .find('>')
                    .ok_or_else(|| malformed("unterminated close tag", self.pos))?;
                let name = self.rest()[2..end].trim().to_string();
                self.pos += end + 1;
                return Ok(Some(XmlEvent::End(name)));
            }

            let end = self
                .rest()
                .find('>')
                .ok_or_else(|| malformed("unterminated open tag", self.pos))?;
            let mut body = &self.rest()[1..end];
            let self_closing = body.ends_with('/');
            if self_closing {
                body = &body[..body.len() - 1];
            }
            let at = self.pos;
            self.pos += end + 1;

            let mut parts = body.splitn(2, char::is_whitespace);
            let name = parts
                .next()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| malformed("empty tag name", at))?
                .to_string();
            let attrs = match parts.next() {
                Some(raw) => parse_attrs(raw, at)?,
                None => Vec::new(),
            };

            if self_closing {
                self.pending_end = Some(name.clone());
            }
            return Ok(Some(XmlEvent::Start { name, attrs }));
        }
    }

    /// Next event that is structurally relevant: whitespace-only text from
    /// pretty-printing writers is skipped. Use when walking the element tree;
    /// leaf values go through [`XmlReader::read_leaf_text`], which keeps
    /// every character.
    pub fn next_element_event(&mut self) -> AppResult<Option<XmlEvent>> {
        loop {
            match self.next_event()? {
                Some(XmlEvent::Text(text)) if text.chars().all(char::is_whitespace) => continue,
                other => return Ok(other),
            }
        }
    }

    /// Consume events until the End that matches an already-consumed Start.
    pub fn skip_element(&mut self) -> AppResult<()> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.next_event()? {
                Some(XmlEvent::Start { .. }) => depth += 1,
                Some(XmlEvent::End(_)) => depth -= 1,
                Some(XmlEvent::Text(_)) => {}
                None => return Err(malformed("document ended inside an element", self.pos)),
            }
        }
        Ok(())
    }

    /// Read the text content of a leaf element whose Start was consumed,
    /// through to its End. Nested markup is rejected.
    pub fn read_leaf_text(&mut self) -> AppResult<String> {
        let mut text = String::new();
        loop {
            match self.next_event()? {
                Some(XmlEvent::Text(chunk)) => text.push_str(&chunk),
                Some(XmlEvent::End(_)) => return Ok(text),
                Some(XmlEvent::Start { .. }) => {
                    return Err(malformed("unexpected markup inside a value", self.pos))
                }
                None => return Err(malformed("document ended inside a value", self.pos)),
            }
        }
    }
}

fn parse_attrs(raw: &str, at: usize) -> AppResult<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    let mut rest = raw.trim();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| malformed("attribute without a value", at))?;
        let name = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let quote = after
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| malformed("attribute value must be quoted", at))?;
        let close = after[1..]
            .find(quote)
            .ok_or_else(|| malformed("unterminated attribute value", at))?;
        let value = unescape_text(&after[1..1 + close], at)?;
        attrs.push((name, value));
        rest = after[close + 2..].trim_start();
    }
    Ok(attrs)
}
