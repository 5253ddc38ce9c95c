// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A minimal FITS primary-header card model.
//!
//! The cube is written with plain file I/O rather than through a FITS library
//! so that the data volume never has to be materialised; only the header
//! cards are modelled here. 80-byte cards, 2880-byte blocks, fixed-format
//! values. The card count is fixed at allocation time so that later keyword
//! updates (CRPIX3) can be rewritten in place without moving the data block.

use std::io::Read;

/// FITS block size in bytes. Headers and data are both padded to this.
pub const BLOCK_SIZE: usize = 2880;

/// Length of a single header card in bytes.
pub const CARD_SIZE: usize = 80;

const CARDS_PER_BLOCK: usize = BLOCK_SIZE / CARD_SIZE;

#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Logical(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    /// COMMENT/HISTORY-style cards: no value indicator, free text.
    Commentary(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub keyword: String,
    pub value: CardValue,
}

impl Card {
    pub fn logical(keyword: &str, v: bool) -> Card {
        Card {
            keyword: keyword.to_string(),
            value: CardValue::Logical(v),
        }
    }

    pub fn integer(keyword: &str, v: i64) -> Card {
        Card {
            keyword: keyword.to_string(),
            value: CardValue::Integer(v),
        }
    }

    pub fn real(keyword: &str, v: f64) -> Card {
        Card {
            keyword: keyword.to_string(),
            value: CardValue::Real(v),
        }
    }

    pub fn text(keyword: &str, v: &str) -> Card {
        Card {
            keyword: keyword.to_string(),
            value: CardValue::Text(v.to_string()),
        }
    }

    pub fn comment(text: &str) -> Card {
        Card {
            keyword: "COMMENT".to_string(),
            value: CardValue::Commentary(text.to_string()),
        }
    }

    fn format(&self) -> [u8; CARD_SIZE] {
        let s = match &self.value {
            CardValue::Logical(v) => {
                format!("{:<8}= {:>20}", self.keyword, if *v { "T" } else { "F" })
            }
            CardValue::Integer(v) => format!("{:<8}= {:>20}", self.keyword, v),
            CardValue::Real(v) => format!("{:<8}= {:>20}", self.keyword, format_real(*v)),
            CardValue::Text(v) => {
                // Embedded single quotes are doubled per the standard.
                format!("{:<8}= '{:<8}'", self.keyword, v.replace('\'', "''"))
            }
            CardValue::Commentary(v) => format!("{:<8}{}", self.keyword, v),
        };
        let mut card = [b' '; CARD_SIZE];
        let bytes = s.as_bytes();
        let n = bytes.len().min(CARD_SIZE);
        card[..n].copy_from_slice(&bytes[..n]);
        card
    }

    /// Parse one 80-byte card. `None` is the END card.
    fn parse(bytes: &[u8]) -> Option<Card> {
        let raw = String::from_utf8_lossy(&bytes[..CARD_SIZE]);
        let keyword = raw[..8].trim_end().to_string();
        if keyword == "END" {
            return None;
        }
        if &raw[8..10] != "= " {
            return Some(Card {
                keyword,
                value: CardValue::Commentary(raw[8..].trim_end().to_string()),
            });
        }

        let field = &raw[10..];
        let value = if let Some(stripped) = field.trim_start().strip_prefix('\'') {
            // The closing quote is the first one not doubled.
            let mut text = String::new();
            let mut chars = stripped.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        text.push('\'');
                    } else {
                        break;
                    }
                } else {
                    text.push(c);
                }
            }
            CardValue::Text(text.trim_end().to_string())
        } else {
            let token = field.split('/').next().unwrap_or("").trim();
            match token {
                "T" => CardValue::Logical(true),
                "F" => CardValue::Logical(false),
                t => {
                    if let Ok(i) = t.parse::<i64>() {
                        CardValue::Integer(i)
                    } else if let Ok(f) = t.parse::<f64>() {
                        CardValue::Real(f)
                    } else {
                        CardValue::Commentary(t.to_string())
                    }
                }
            }
        };
        Some(Card { keyword, value })
    }
}

/// Format a real value for a fixed-format card. `{:E}` round-trips f64 and
/// cfitsio's strtod parses it back.
fn format_real(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v:E}")
    }
}

/// An ordered set of header cards (exclusive of END).
#[derive(Debug, Clone, Default)]
pub struct CubeHeader {
    pub cards: Vec<Card>,
}

impl CubeHeader {
    /// Header length in bytes, END card and block padding included.
    pub fn byte_len(&self) -> usize {
        let n_cards = self.cards.len() + 1;
        n_cards.div_ceil(CARDS_PER_BLOCK) * BLOCK_SIZE
    }

    /// Serialise all cards, the END card, and space padding to a whole number
    /// of blocks.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.byte_len());
        for card in &self.cards {
            bytes.extend_from_slice(&card.format());
        }
        let mut end = [b' '; CARD_SIZE];
        end[..3].copy_from_slice(b"END");
        bytes.extend_from_slice(&end);
        bytes.resize(self.byte_len(), b' ');
        bytes
    }

    /// Read header blocks from `reader` until the END card.
    pub fn from_reader<R: Read>(reader: &mut R) -> std::io::Result<Option<CubeHeader>> {
        let mut cards = vec![];
        loop {
            let mut block = [0_u8; BLOCK_SIZE];
            reader.read_exact(&mut block)?;
            for card_bytes in block.chunks_exact(CARD_SIZE) {
                match Card::parse(card_bytes) {
                    Some(card) => cards.push(card),
                    None => return Ok(Some(CubeHeader { cards })),
                }
            }
            // An END-less header means this isn't a file we wrote.
            if cards.len() >= 1000 {
                return Ok(None);
            }
        }
    }

    pub fn get(&self, keyword: &str) -> Option<&CardValue> {
        self.cards
            .iter()
            .find(|c| c.keyword == keyword)
            .map(|c| &c.value)
    }

    pub fn get_integer(&self, keyword: &str) -> Option<i64> {
        match self.get(keyword)? {
            CardValue::Integer(i) => Some(*i),
            CardValue::Real(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn get_real(&self, keyword: &str) -> Option<f64> {
        match self.get(keyword)? {
            CardValue::Real(f) => Some(*f),
            CardValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Replace the value of an existing card; the card count (and therefore
    /// the header size) never changes. Returns false if the keyword is
    /// absent.
    pub fn set(&mut self, keyword: &str, value: CardValue) -> bool {
        match self.cards.iter_mut().find(|c| c.keyword == keyword) {
            Some(card) => {
                card.value = value;
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, card: Card) {
        self.cards.push(card);
    }
}
