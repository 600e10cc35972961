// The MIT License (MIT)
//
// Copyright (c) 2020, National Cybersecurity Agency of France (ANSSI)
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! String substitution seam.
//!
//! Shell-facing layers inline stored values into command lines with a
//! bracketed-key syntax: every `[key]` in a line is replaced by asking a
//! chain of [`Source`]s for `key`. The shell itself lives outside this
//! crate; the stores only implement `Source`.
//!
//! A `[` is escaped by doubling it; a bracket pair no source can resolve is
//! left in the text verbatim.
//!
//! [`Source`]: trait.Source.html

/// A provider of substitution values.
pub trait Source {
    /// Returns the replacement text for `key`, if this source knows it.
    fn replace(&self, key: &str) -> Option<String>;
}

/// Expands every `[key]` in `text` against the given sources, first match
/// wins.
pub fn substitute(text: &str, sources: &[&dyn Source]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        if after.starts_with('[') {
            // "[[" escapes a literal bracket
            out.push('[');
            rest = &after[1..];
            continue;
        }
        match after.find(']') {
            Some(close) => {
                let key = &after[..close];
                match sources.iter().filter_map(|s| s.replace(key)).next() {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('[');
                        out.push_str(key);
                        out.push(']');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('[');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use speculate::speculate; // Must be imported into the current scope.

    struct Fixed;
    impl Source for Fixed {
        fn replace(&self, key: &str) -> Option<String> {
            match key {
                "name" => Some("coral".to_string()),
                "port" => Some("115200".to_string()),
                _ => None,
            }
        }
    }

    speculate! {
        describe "substitute" {
            before {
                let fixed = Fixed;
                let sources: &[&dyn Source] = &[&fixed];
            }

            it "replaces known keys" {
                assert_eq!(substitute("hello [name]!", sources), "hello coral!");
                assert_eq!(substitute("[name] [port]", sources), "coral 115200");
            }

            it "leaves unknown keys verbatim" {
                assert_eq!(substitute("echo [unknown]", sources), "echo [unknown]");
            }

            it "escapes doubled brackets" {
                assert_eq!(substitute("a [[literal] [name]", sources), "a [literal] coral");
            }

            it "keeps an unterminated bracket" {
                assert_eq!(substitute("oops [name", sources), "oops [name");
            }

            it "asks sources in order" {
                struct Shadow;
                impl Source for Shadow {
                    fn replace(&self, key: &str) -> Option<String> {
                        if key == "name" { Some("shadow".to_string()) } else { None }
                    }
                }
                let shadow = Shadow;
                let fixed = Fixed;
                let chained: &[&dyn Source] = &[&shadow, &fixed];
                assert_eq!(substitute("[name] [port]", chained), "shadow 115200");
            }
        }
    }
}
