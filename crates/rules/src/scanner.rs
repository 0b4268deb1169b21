//! Character-level scanner for the tagged data blocks of a match line
//!
//! Input is everything after the service name, e.g.
//! `m|^SSH-([\d.]+)|s p/OpenSSH/ v/$1/ cpe:/a:openbsd:openssh/a`.
//! Each block is `<tag><delim><data><delim><options>`; tags are the single
//! characters `p v i h o d m` or the literal `cpe:`.

use crate::error::RuleParseError;

const TAGS: [char; 7] = ['p', 'v', 'i', 'h', 'o', 'd', 'm'];
const CPE_TAG: &str = "cpe:";
const MAX_TAG_LEN: usize = 4;

/// One scanned block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    /// `"m"`, `"p"`, ... or `"cpe:"`.
    pub tag: String,
    pub data: String,
    /// Characters trailing the closing delimiter (`i`, `s`, `a`).
    pub options: String,
}

impl DataBlock {
    #[inline]
    #[must_use]
    pub fn is_cpe(&self) -> bool {
        self.tag == CPE_TAG
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Start,
    SetDataDelimiter,
    StartData,
    InData,
    SetDataBlockOptions,
}

/// State machine over the block list of a match line.
#[derive(Debug)]
pub struct DataBlockScanner {
    state: State,
    tag: String,
    delimiter: char,
    data: String,
    options: String,
    blocks: Vec<DataBlock>,
}

impl Default for DataBlockScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl DataBlockScanner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Init,
            tag: String::new(),
            delimiter: '/',
            data: String::new(),
            options: String::new(),
            blocks: Vec::new(),
        }
    }

    /// Scan `input` into its blocks.
    pub fn scan(input: &str) -> Result<Vec<DataBlock>, RuleParseError> {
        let mut scanner = Self::new();
        for (offset, ch) in input.char_indices() {
            scanner.feed(offset, ch)?;
        }
        scanner.finish()
    }

    fn feed(&mut self, offset: usize, ch: char) -> Result<(), RuleParseError> {
        match self.state {
            State::Init => {
                if ch.is_whitespace() {
                    return Ok(());
                }
                self.state = State::Start;
                self.feed_tag(offset, ch)?;
            }
            State::Start => self.feed_tag(offset, ch)?,
            State::SetDataDelimiter => {
                self.delimiter = ch;
                self.state = State::StartData;
            }
            State::StartData => {
                self.data.clear();
                if ch == self.delimiter {
                    self.state = State::SetDataBlockOptions;
                } else {
                    self.data.push(ch);
                    self.state = State::InData;
                }
            }
            State::InData => {
                if ch == self.delimiter {
                    self.state = State::SetDataBlockOptions;
                } else {
                    self.data.push(ch);
                }
            }
            State::SetDataBlockOptions => {
                if ch.is_whitespace() {
                    self.commit();
                    self.state = State::Init;
                } else {
                    self.options.push(ch);
                }
            }
        }
        Ok(())
    }

    fn feed_tag(&mut self, offset: usize, ch: char) -> Result<(), RuleParseError> {
        self.tag.push(ch);
        let recognised = (self.tag.len() == 1 && TAGS.contains(&ch)) || self.tag == CPE_TAG;
        if recognised {
            self.state = State::SetDataDelimiter;
        } else if self.tag.len() > MAX_TAG_LEN {
            return Err(RuleParseError::DataBlock(format!(
                "unrecognised block option {:?} at byte {offset}",
                self.tag
            )));
        }
        Ok(())
    }

    fn commit(&mut self) {
        self.blocks.push(DataBlock {
            tag: std::mem::take(&mut self.tag),
            data: std::mem::take(&mut self.data),
            options: std::mem::take(&mut self.options),
        });
    }

    fn finish(mut self) -> Result<Vec<DataBlock>, RuleParseError> {
        match self.state {
            State::Init => {}
            State::SetDataBlockOptions => self.commit(),
            State::Start | State::SetDataDelimiter => {
                return Err(RuleParseError::DataBlock(format!(
                    "dangling block option {:?}",
                    self.tag
                )))
            }
            State::StartData | State::InData => {
                return Err(RuleParseError::DataBlock(format!(
                    "unterminated {:?} block, missing closing {:?}",
                    self.tag, self.delimiter
                )))
            }
        }
        Ok(self.blocks)
    }
}
