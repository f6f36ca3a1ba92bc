// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! A reader for DNS master files (RFC 1035 § 5).
//!
//! This implements the line-oriented subset the `MasterFiles` loader
//! needs: one record per line, `$ORIGIN` and `$TTL` directives,
//! comments, owner inheritance from the previous record, and relative
//! owner names. Multi-line records (parentheses) and escape sequences
//! are not supported. Names inside RDATA are taken as absolute.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use crate::class::Class;
use crate::name::{Name, NameError};
use crate::rr::{validate_rdata, RdataError, Ttl, Type};

/// A reader over one master file, producing one [`Record`] per
/// (non-empty, non-directive) line.
pub struct Reader {
    lines: Lines<BufReader<File>>,
    path: PathBuf,
    number: usize,
    origin: Option<Name>,
    default_ttl: Option<Ttl>,
    last_owner: Option<Name>,
    last_ttl: Option<Ttl>,
}

/// A record read from a master file, with the line number it came from.
#[derive(Clone, Debug)]
pub struct Line {
    pub record: Record,
    pub number: usize,
}

/// The substance of a record line.
#[derive(Clone, Debug)]
pub struct Record {
    pub owner: Name,
    pub rr_type: Type,
    pub class: Class,
    pub ttl: Ttl,
    pub rdata: String,
}

impl Reader {
    /// Opens the master file at `path`. The `origin` is used to resolve
    /// `@` and relative owner names until a `$ORIGIN` directive
    /// overrides it.
    pub fn open(path: impl AsRef<Path>, origin: Option<Name>) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            path: path.as_ref().to_owned(),
            number: 0,
            origin,
            default_ttl: None,
            last_owner: None,
            last_ttl: None,
        })
    }

    /// Returns the path of the file being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, kind: ErrorKind) -> Error {
        Error {
            path: self.path.clone(),
            number: self.number,
            kind,
        }
    }

    fn handle_directive(&mut self, line: &str) -> Result<(), Error> {
        let mut tokens = line.split_whitespace();
        let directive = tokens.next().unwrap_or("");
        let argument = tokens
            .next()
            .ok_or_else(|| self.error(ErrorKind::Syntax("directive requires an argument")))?;
        if directive.eq_ignore_ascii_case("$ORIGIN") {
            let origin = argument
                .parse()
                .map_err(|e| self.error(ErrorKind::Name(e)))?;
            self.origin = Some(origin);
            Ok(())
        } else if directive.eq_ignore_ascii_case("$TTL") {
            let raw: u32 = argument
                .parse()
                .map_err(|_| self.error(ErrorKind::Syntax("$TTL requires an integer")))?;
            self.default_ttl = Some(Ttl::from(raw));
            Ok(())
        } else {
            Err(self.error(ErrorKind::UnknownDirective(directive.to_owned())))
        }
    }

    fn parse_record(&mut self, line: &str) -> Result<Record, Error> {
        let mut tokens = split_tokens(line);

        // The owner is present only if the line does not start with
        // whitespace; otherwise it is inherited from the previous
        // record.
        let owner = if line.starts_with(char::is_whitespace) {
            self.last_owner
                .clone()
                .ok_or_else(|| self.error(ErrorKind::Syntax("record has no owner to inherit")))?
        } else {
            let (_, token) = tokens.remove(0);
            self.resolve_owner(token)?
        };

        // Next come the TTL and class, each optional and in either
        // order, followed by the type.
        let mut ttl = None;
        let mut class = None;
        let mut rr_type = None;
        let mut rdata_start = line.len();
        for (start, token) in tokens {
            if ttl.is_none() {
                if let Ok(raw) = token.parse::<u32>() {
                    ttl = Some(Ttl::from(raw));
                    continue;
                }
            }
            if class.is_none() {
                if let Ok(parsed) = token.parse::<Class>() {
                    class = Some(parsed);
                    continue;
                }
            }
            let parsed = token
                .parse::<Type>()
                .map_err(|_| self.error(ErrorKind::UnknownType(token.to_owned())))?;
            rr_type = Some(parsed);
            rdata_start = start + token.len();
            break;
        }
        let rr_type =
            rr_type.ok_or_else(|| self.error(ErrorKind::Syntax("record has no RR type")))?;

        let ttl = ttl
            .or(self.default_ttl)
            .or(self.last_ttl)
            .ok_or_else(|| self.error(ErrorKind::Syntax("record has no TTL")))?;
        let class = class.unwrap_or(Class::IN);

        let rdata = validate_rdata(rr_type, &line[rdata_start..])
            .map_err(|e| self.error(ErrorKind::Rdata(e)))?;

        self.last_owner = Some(owner.clone());
        self.last_ttl = Some(ttl);
        Ok(Record {
            owner,
            rr_type,
            class,
            ttl,
            rdata,
        })
    }

    fn resolve_owner(&self, token: &str) -> Result<Name, Error> {
        if token == "@" {
            return self
                .origin
                .clone()
                .ok_or_else(|| self.error(ErrorKind::Syntax("@ used without an origin")));
        }
        let text = match (&self.origin, token.ends_with('.')) {
            (Some(origin), false) => format!("{}.{}", token, origin),
            _ => token.to_owned(),
        };
        text.parse().map_err(|e| self.error(ErrorKind::Name(e)))
    }
}

impl Iterator for Reader {
    type Item = Result<Line, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(self.error(ErrorKind::Io(e)))),
            };
            self.number += 1;

            let line = strip_comment(&line);
            if line.trim().is_empty() {
                continue;
            }
            if line.trim_start().starts_with('$') {
                match self.handle_directive(line) {
                    Ok(()) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }
            let number = self.number;
            return Some(self.parse_record(line).map(|record| Line { record, number }));
        }
    }
}

/// Removes a trailing comment, respecting character strings: a `;`
/// inside double quotes does not begin a comment.
fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => return &line[..i],
            _ => (),
        }
    }
    line
}

/// Splits a line into whitespace-separated tokens, keeping each token's
/// byte offset so the caller can recover the raw tail of the line.
fn split_tokens(line: &str) -> Vec<(usize, &str)> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push((s, &line[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push((s, &line[s..]));
    }
    tokens
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while reading a master file, with the file and
/// line it occurred on.
#[derive(Debug)]
pub struct Error {
    pub path: PathBuf,
    pub number: usize,
    pub kind: ErrorKind,
}

#[derive(Debug)]
pub enum ErrorKind {
    Io(io::Error),
    Syntax(&'static str),
    Name(NameError),
    Rdata(RdataError),
    UnknownDirective(String),
    UnknownType(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} line {}: ", self.path.display(), self.number)?;
        match &self.kind {
            ErrorKind::Io(e) => write!(f, "I/O error: {}", e),
            ErrorKind::Syntax(what) => f.write_str(what),
            ErrorKind::Name(e) => write!(f, "bad name: {}", e),
            ErrorKind::Rdata(e) => write!(f, "bad RDATA: {}", e),
            ErrorKind::UnknownDirective(d) => write!(f, "unknown directive {}", d),
            ErrorKind::UnknownType(t) => write!(f, "unknown RR type {}", t),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
