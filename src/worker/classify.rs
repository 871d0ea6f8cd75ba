//! Filename-based image labelling

use std::fmt;

use crate::producer::TASK_ID_SEPARATOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Cat,
    Dog,
    Unknown,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Cat => "cat",
            Label::Dog => "dog",
            Label::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Part of a stored filename between the task id separator and the extension
///
/// `"<uuid>_photo_cat_1.png"` → `"photo_cat_1"`. Returns `None` when the name
/// has no separator, i.e. it was not produced by the upload path.
pub fn name_token(stored_filename: &str) -> Option<&str> {
    let stem = match stored_filename.rsplit_once('.') {
        Some((stem, _extension)) => stem,
        None => stored_filename,
    };
    stem.split_once(TASK_ID_SEPARATOR).map(|(_, token)| token)
}

/// Case-insensitive substring match on the token; `cat` wins over `dog`
pub fn classify_token(token: &str) -> Label {
    let token = token.to_lowercase();
    if token.contains("cat") {
        Label::Cat
    } else if token.contains("dog") {
        Label::Dog
    } else {
        Label::Unknown
    }
}
