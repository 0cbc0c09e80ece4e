#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::LazyLock;

use chatweave_domain::EmoteSpan;
use regex::Regex;

static URL_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"(?i)((https?|ftp)://|www\.)\S+").expect("valid url regex"));

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\S+").expect("valid token regex"));

/// HTML-entity escape of the five characters that can open markup.
pub fn escape_html(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	for c in raw.chars() {
		push_escaped(&mut out, c);
	}
	out
}

fn push_escaped(out: &mut String, c: char) {
	match c {
		'&' => out.push_str("&amp;"),
		'<' => out.push_str("&lt;"),
		'>' => out.push_str("&gt;"),
		'"' => out.push_str("&quot;"),
		'\'' => out.push_str("&#39;"),
		_ => out.push(c),
	}
}

/// Standard emote image fragment used by the dictionary pass.
pub fn emote_img_markup(src: &str) -> String {
	format!("<img class=\"emoticon\" src=\"{src}\" />")
}

/// Message text moving through the ordered transform passes.
///
/// Byte ranges of already-inserted markup are tracked so later passes only
/// touch the segments outside them; inserted fragments are never
/// re-escaped, re-linkified or re-substituted.
#[derive(Debug, Clone)]
pub struct TransformedText {
	text: String,
	protected: Vec<(usize, usize)>,
}

impl TransformedText {
	/// Start the pipeline with the escape pass applied.
	pub fn escaped(raw: &str) -> Self {
		Self {
			text: escape_html(raw),
			protected: Vec::new(),
		}
	}

	/// Start the pipeline with the escape pass disabled.
	pub fn plain(raw: &str) -> Self {
		Self {
			text: raw.to_string(),
			protected: Vec::new(),
		}
	}

	pub fn as_str(&self) -> &str {
		&self.text
	}

	pub fn into_string(self) -> String {
		self.text
	}

	/// Wrap URL matches (`http(s)://`, `ftp://`, bare `www.`) in anchor
	/// fragments, outside already-inserted markup.
	pub fn linkify(&mut self) -> &mut Self {
		self.apply_outside_protected(|segment| {
			let mut out = String::new();
			let mut inserted = Vec::new();
			let mut last = 0;

			for m in URL_RE.find_iter(segment) {
				out.push_str(&segment[last..m.start()]);
				let url = m.as_str();
				let anchor = format!("<a href='{url}' class='link'>{url}</a>");
				inserted.push((out.len(), out.len() + anchor.len()));
				out.push_str(&anchor);
				last = m.end();
			}
			out.push_str(&segment[last..]);

			(out, inserted)
		});
		self
	}

	/// Replace whole whitespace-delimited tokens found in `dict`
	/// (token -> image source) with emote image fragments, outside
	/// already-inserted markup.
	pub fn substitute_emote_tokens(&mut self, dict: &HashMap<String, String>) -> &mut Self {
		if dict.is_empty() {
			return self;
		}

		self.apply_outside_protected(|segment| {
			let mut out = String::new();
			let mut inserted = Vec::new();
			let mut last = 0;

			for m in TOKEN_RE.find_iter(segment) {
				out.push_str(&segment[last..m.start()]);
				match dict.get(m.as_str()) {
					Some(src) => {
						let markup = emote_img_markup(src);
						inserted.push((out.len(), out.len() + markup.len()));
						out.push_str(&markup);
					}
					None => out.push_str(m.as_str()),
				}
				last = m.end();
			}
			out.push_str(&segment[last..]);

			(out, inserted)
		});
		self
	}

	fn apply_outside_protected<F>(&mut self, pass: F)
	where
		F: Fn(&str) -> (String, Vec<(usize, usize)>),
	{
		let mut out = String::new();
		let mut protected = Vec::new();
		let mut cursor = 0;

		for &(start, end) in &self.protected {
			let (replaced, inserted) = pass(&self.text[cursor..start]);
			let base = out.len();
			out.push_str(&replaced);
			protected.extend(inserted.into_iter().map(|(s, e)| (base + s, base + e)));

			protected.push((out.len(), out.len() + (end - start)));
			out.push_str(&self.text[start..end]);
			cursor = end;
		}

		let (replaced, inserted) = pass(&self.text[cursor..]);
		let base = out.len();
		out.push_str(&replaced);
		protected.extend(inserted.into_iter().map(|(s, e)| (base + s, base + e)));

		self.text = out;
		self.protected = protected;
	}
}

/// Splice emote markup into `raw` at the given spans.
///
/// Reproduces the reference rewrite: spans are flattened, sorted ascending
/// by start, then walked with a running offset tracking the net length
/// delta already introduced into the output; each span is replaced by
/// `markup(span)` via `left + fragment + right` slicing with clamped
/// indices. Escaping, when enabled, applies only to characters that came
/// from the raw string, never to inserted fragments.
///
/// Offsets count Unicode scalar values of the original string. Behavior
/// for overlapping or out-of-order spans across emote ids is undefined:
/// the splice runs as written and the result is unspecified.
pub fn rewrite_emote_spans<F>(raw: &str, spans: &[EmoteSpan], markup: F, escape_unmodified: bool) -> String
where
	F: Fn(&EmoteSpan) -> String,
{
	// (char, came-from-raw) pairs so the escape pass can tell unmodified
	// segments from inserted fragments after splicing.
	let mut out: Vec<(char, bool)> = raw.chars().map(|c| (c, true)).collect();

	let mut ordered: Vec<&EmoteSpan> = spans.iter().collect();
	ordered.sort_by_key(|s| s.start);

	let mut offset: isize = 0;
	for span in ordered {
		let len = out.len();
		let left_end = clamp_index(span.start as isize + offset, len);
		let right_start = clamp_index(span.end as isize + 1 + offset, len);

		let fragment: Vec<(char, bool)> = markup(span).chars().map(|c| (c, false)).collect();
		offset += fragment.len() as isize - (span.end as isize - span.start as isize + 1);

		out.splice(left_end..right_start, fragment);
	}

	let mut body = String::with_capacity(out.len());
	for (c, from_raw) in out {
		if from_raw && escape_unmodified {
			push_escaped(&mut body, c);
		} else {
			body.push(c);
		}
	}
	body
}

fn clamp_index(idx: isize, len: usize) -> usize {
	idx.clamp(0, len as isize) as usize
}

/// Effective delay before the next poll fetch: the configured interval
/// acts as a minimum over any server-suggested interval.
pub fn effective_poll_delay(configured_ms: u64, server_suggested_ms: Option<u64>) -> u64 {
	match server_suggested_ms {
		Some(suggested) => suggested.max(configured_ms),
		None => configured_ms,
	}
}
