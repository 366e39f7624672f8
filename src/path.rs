use std::fmt;
use std::str::FromStr;

/// One step of a [`Path`]: a map key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    Key(Vec<u8>),
    Index(u64),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Key(key) => write!(f, "{}", String::from_utf8_lossy(key)),
            Step::Index(index) => write!(f, "{}", index),
        }
    }
}

/// Location of an entity below the transaction root.
///
/// The textual form separates steps with `/`; segments made only of ASCII
/// digits are array indices, everything else is a map key. There is no
/// escaping, so keys containing `/` or consisting only of digits need the
/// builder form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<Step>);

impl Path {
    /// The empty path, naming the root map.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parse(text: &str) -> Self {
        let steps = text
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                let numeric = segment.bytes().all(|b| b.is_ascii_digit());
                match segment.parse::<u64>() {
                    Ok(index) if numeric => Step::Index(index),
                    _ => Step::Key(segment.as_bytes().to_vec()),
                }
            })
            .collect();
        Self(steps)
    }

    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.0.push(Step::Key(key.as_ref().to_vec()));
        self
    }

    pub fn index(mut self, index: u64) -> Self {
        self.0.push(Step::Index(index));
        self
    }

    pub fn push(&mut self, step: Step) {
        self.0.push(step);
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Steps leading to the parent and the final step.
    pub fn split_last(&self) -> Option<(&[Step], &Step)> {
        self.0.split_last().map(|(last, parent)| (parent, last))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for step in &self.0 {
            write!(f, "/{}", step)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Path::parse(s))
    }
}

impl From<&str> for Path {
    fn from(text: &str) -> Self {
        Path::parse(text)
    }
}

impl From<&String> for Path {
    fn from(text: &String) -> Self {
        Path::parse(text)
    }
}

impl From<&Path> for Path {
    fn from(path: &Path) -> Self {
        path.clone()
    }
}

impl From<Vec<Step>> for Path {
    fn from(steps: Vec<Step>) -> Self {
        Self(steps)
    }
}
