//! Streaming tree hashing of tar archives.
//!
//! A tree hash covers a tar stream's logical tree (entry paths and entry
//! contents) and is independent of tar block padding and trailing zero
//! blocks. Two conventions exist side by side: the canonical one hashes
//! every entry, while the legacy *skip-empty* convention omits directory
//! entries (a directory carries no content of its own; non-empty directories
//! are still represented through their children's paths). Historical
//! tarballs are addressed under the skip-empty convention, so both digests
//! are computed in a single pass over the stream.
//!
//! Per entry the digest absorbs the full path, a NUL byte, the decimal
//! content size, a newline, then the content bytes. PAX and GNU extension
//! headers contribute to neither convention.

use crate::resource::TreeHash;
use sha1::{Digest, Sha1};

const BLOCK: usize = 512;

/// Both tree hashes of one tar stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeHashPair {
    /// Hash under the legacy skip-empty-directories convention.
    pub skip_empty: TreeHash,
    /// Hash under the canonical convention.
    pub no_skip: TreeHash,
}

impl TreeHashPair {
    /// Whether either convention produces `hash`.
    pub fn matches(&self, hash: TreeHash) -> bool {
        self.no_skip == hash || self.skip_empty == hash
    }
}

enum State {
    /// Accumulating the next 512-byte header block.
    Header,
    /// Consuming entry content plus its zero padding.
    Content {
        remaining: u64,
        padding: usize,
        into_skip: bool,
        into_no_skip: bool,
    },
    /// A zero block was seen; the rest of the stream is trailer.
    Trailer,
}

/// Push-based tar parser feeding both tree-hash digests.
pub struct TarTreeHasher {
    skip: Sha1,
    no_skip: Sha1,
    state: State,
    block: [u8; BLOCK],
    filled: usize,
    entries: u64,
}

impl TarTreeHasher {
    /// Create a hasher for a fresh tar stream.
    pub fn new() -> Self {
        Self {
            skip: Sha1::new(),
            no_skip: Sha1::new(),
            state: State::Header,
            block: [0u8; BLOCK],
            filled: 0,
            entries: 0,
        }
    }

    /// Number of tar entries seen so far.
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Feed decompressed tar bytes.
    pub fn update(&mut self, mut data: &[u8]) -> crate::Result<()> {
        while !data.is_empty() {
            if matches!(self.state, State::Trailer) {
                return Ok(());
            }
            if matches!(self.state, State::Header) {
                let take = (BLOCK - self.filled).min(data.len());
                self.block[self.filled..self.filled + take].copy_from_slice(&data[..take]);
                self.filled += take;
                data = &data[take..];
                if self.filled == BLOCK {
                    self.filled = 0;
                    self.state = self.parse_header()?;
                }
                continue;
            }

            let State::Content {
                remaining,
                padding,
                into_skip,
                into_no_skip,
            } = &mut self.state
            else {
                unreachable!("header and trailer states handled above");
            };
            if *remaining > 0 {
                let take = (*remaining).min(data.len() as u64) as usize;
                if *into_no_skip {
                    self.no_skip.update(&data[..take]);
                }
                if *into_skip {
                    self.skip.update(&data[..take]);
                }
                *remaining -= take as u64;
                data = &data[take..];
            } else if *padding > 0 {
                let take = (*padding).min(data.len());
                *padding -= take;
                data = &data[take..];
            } else {
                self.state = State::Header;
            }
        }
        // A content state that ran dry of both payload and padding still
        // needs to flip back so finalize() sees a clean boundary.
        if let State::Content {
            remaining: 0,
            padding: 0,
            ..
        } = self.state
        {
            self.state = State::Header;
        }
        Ok(())
    }

    /// Finish the stream and return both digests.
    ///
    /// Fails if the stream ends in the middle of a header or entry.
    pub fn finalize(self) -> crate::Result<TreeHashPair> {
        match self.state {
            State::Header if self.filled == 0 => {}
            State::Trailer => {}
            State::Header => {
                return Err(crate::Error::MalformedTar(format!(
                    "truncated header block ({} of {BLOCK} bytes)",
                    self.filled
                )));
            }
            State::Content { remaining, .. } => {
                return Err(crate::Error::MalformedTar(format!(
                    "truncated entry ({remaining} content bytes missing)"
                )));
            }
        }
        Ok(TreeHashPair {
            skip_empty: TreeHash::from_bytes(self.skip.finalize().into()),
            no_skip: TreeHash::from_bytes(self.no_skip.finalize().into()),
        })
    }

    fn parse_header(&mut self) -> crate::Result<State> {
        if self.block.iter().all(|&b| b == 0) {
            return Ok(State::Trailer);
        }

        let size = parse_size(&self.block[124..136])?;
        let typeflag = self.block[156];
        let padding = (BLOCK - (size % BLOCK as u64) as usize) % BLOCK;

        // PAX/GNU extension headers describe the next entry; they are not
        // part of the logical tree.
        let is_extension = matches!(typeflag, b'x' | b'g' | b'L' | b'K');
        let is_dir = typeflag == b'5';

        if !is_extension {
            let path = self.entry_path();
            let line_tail = format!("\0{size}\n");
            self.no_skip.update(&path);
            self.no_skip.update(line_tail.as_bytes());
            if !is_dir {
                self.skip.update(&path);
                self.skip.update(line_tail.as_bytes());
            }
            self.entries += 1;
        }

        Ok(State::Content {
            remaining: size,
            padding,
            into_skip: !is_extension && !is_dir,
            into_no_skip: !is_extension && !is_dir,
        })
    }

    fn entry_path(&self) -> Vec<u8> {
        let name = field(&self.block[0..100]);
        let prefix = field(&self.block[345..500]);
        if prefix.is_empty() {
            name.to_vec()
        } else {
            let mut path = prefix.to_vec();
            path.push(b'/');
            path.extend_from_slice(name);
            path
        }
    }
}

impl Default for TarTreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A NUL-terminated header field.
fn field(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Tar size field: octal text, or base-256 when the high bit of the first
/// byte is set (GNU large-file extension).
fn parse_size(bytes: &[u8]) -> crate::Result<u64> {
    if bytes[0] & 0x80 != 0 {
        let mut value: u64 = (bytes[0] & 0x7f) as u64;
        for &b in &bytes[1..] {
            value = value
                .checked_mul(256)
                .and_then(|v| v.checked_add(b as u64))
                .ok_or_else(|| {
                    crate::Error::MalformedTar("base-256 size overflows u64".to_string())
                })?;
        }
        return Ok(value);
    }
    let text = std::str::from_utf8(field(bytes))
        .map_err(|_| crate::Error::MalformedTar("non-utf8 size field".to_string()))?
        .trim_matches(|c| c == ' ' || c == '\0');
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8)
        .map_err(|_| crate::Error::MalformedTar(format!("bad octal size field: {text:?}")))
}
