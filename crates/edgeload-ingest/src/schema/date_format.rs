//! Date patterns
//!
//! Schemas describe dates with the familiar letter patterns
//! (`yyyy-MM-dd'T'HH:mm:ss.SSSZ`). A pattern is translated once into a chrono
//! format string and everything is parsed and rendered in UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// A compiled date pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFormat {
    pattern: String,
    chrono: String,
    has_time: bool,
    has_zone: bool,
}

impl DateFormat {
    /// Compile `pattern`. Unknown pattern letters and unterminated quotes are
    /// rejected.
    pub fn compile(pattern: &str) -> Result<Self, String> {
        if pattern.trim().is_empty() {
            return Err("pattern is empty".to_string());
        }

        let chars: Vec<char> = pattern.chars().collect();
        let mut out = String::with_capacity(pattern.len() * 2);
        let mut has_time = false;
        let mut has_zone = false;
        let mut has_date = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];

            if c == '\'' {
                // '' is a literal quote, otherwise copy up to the closing quote
                if chars.get(i + 1) == Some(&'\'') {
                    out.push('\'');
                    i += 2;
                    continue;
                }
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(format!("unterminated quote at position {i}")),
                        Some('\'') if chars.get(j + 1) == Some(&'\'') => {
                            out.push('\'');
                            j += 2;
                        },
                        Some('\'') => break,
                        Some(&lit) => {
                            push_literal(&mut out, lit);
                            j += 1;
                        },
                    }
                }
                i = j + 1;
                continue;
            }

            if !c.is_ascii_alphabetic() {
                push_literal(&mut out, c);
                i += 1;
                continue;
            }

            let mut run = 1;
            while chars.get(i + run) == Some(&c) {
                run += 1;
            }

            let spec = match (c, run) {
                ('y', 2) => "%y",
                ('y', _) => "%Y",
                ('M', 1 | 2) => "%m",
                ('M', 3) => "%b",
                ('M', _) => "%B",
                ('d', _) => "%d",
                ('D', _) => "%j",
                ('E', 1..=3) => "%a",
                ('E', _) => "%A",
                ('H', _) => "%H",
                ('h', _) => "%I",
                ('m', _) => "%M",
                ('s', _) => "%S",
                ('S', 3) => "%3f",
                ('S', 6) => "%6f",
                ('S', 9) => "%9f",
                ('S', n) => return Err(format!("fraction width {n} is not supported (use SSS, SSSSSS or SSSSSSSSS)")),
                ('a', _) => "%p",
                ('Z' | 'X', _) => "%z",
                (other, _) => return Err(format!("unsupported pattern letter '{other}'")),
            };

            match c {
                'y' | 'M' | 'd' | 'D' => has_date = true,
                'H' | 'h' | 'm' | 's' | 'S' | 'a' => has_time = true,
                'Z' | 'X' => has_zone = true,
                _ => {},
            }
            out.push_str(spec);
            i += run;
        }

        if !has_date {
            return Err("pattern has no date component".to_string());
        }

        Ok(Self {
            pattern: pattern.to_string(),
            chrono: out,
            has_time,
            has_zone,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Parse `value`; `None` when it does not match the pattern.
    pub fn parse(&self, value: &str) -> Option<DateTime<Utc>> {
        if self.has_zone {
            DateTime::parse_from_str(value, &self.chrono)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        } else if self.has_time {
            NaiveDateTime::parse_from_str(value, &self.chrono)
                .ok()
                .map(|d| d.and_utc())
        } else {
            NaiveDate::parse_from_str(value, &self.chrono)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        }
    }

    pub fn format(&self, value: &DateTime<Utc>) -> String {
        value.format(&self.chrono).to_string()
    }
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}
