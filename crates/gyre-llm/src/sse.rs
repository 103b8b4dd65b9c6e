//! Incremental server-sent-events parser for provider streams.

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty()
    }
}

/// Feed chunks as they arrive; completed events fall out at blank lines.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current: SseEvent,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut completed = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !self.current.is_empty() {
                    completed.push(std::mem::take(&mut self.current));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => self.current.event = Some(value.to_string()),
                "data" => {
                    if !self.current.data.is_empty() {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                }
                _ => {}
            }
        }

        completed
    }

    /// Flush the trailing event when the stream ends without a blank line.
    pub fn finish(mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            self.buffer.push('\n');
            let mut tail = self.push("");
            if let Some(event) = tail.pop() {
                return Some(event);
            }
        }
        if self.current.is_empty() {
            None
        } else {
            Some(self.current)
        }
    }
}
