//! HLS attribute lists: `NAME=VALUE,NAME="VALUE",...`.

/// Attributes in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributeList {
    entries: Vec<(String, String)>,
}

impl AttributeList {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse `name` as an unsigned integer; absent attributes yield `None`.
    pub fn get_u64(&self, name: &str) -> Result<Option<u64>, String> {
        self.get(name)
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|_| format!("attribute {name} is not an integer: `{v}`"))
            })
            .transpose()
    }

    pub fn get_f64(&self, name: &str) -> Result<Option<f64>, String> {
        self.get(name)
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .map_err(|_| format!("attribute {name} is not a number: `{v}`"))
            })
            .transpose()
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| v.eq_ignore_ascii_case("YES"))
    }
}

impl FromIterator<(String, String)> for AttributeList {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Parse an attribute list.
///
/// Quoted values keep embedded commas verbatim. Unquoted values run up to the
/// next comma that is not escaped with a backslash.
pub fn parse_attribute_list(input: &str) -> Result<AttributeList, String> {
    let mut entries = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("attribute without value: `{rest}`"))?;
        let name = rest[..eq].trim();
        if name.is_empty() || name.contains(',') {
            return Err(format!("malformed attribute name: `{}`", &rest[..eq]));
        }
        rest = &rest[eq + 1..];

        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let close = quoted
                .find('"')
                .ok_or_else(|| format!("unterminated quoted value for attribute {name}"))?;
            value = quoted[..close].to_string();
            rest = quoted[close + 1..].trim_start();
            match rest.strip_prefix(',') {
                Some(after) => rest = after.trim_start(),
                None if rest.is_empty() => {}
                None => {
                    return Err(format!(
                        "unexpected characters after quoted value of {name}: `{rest}`"
                    ));
                }
            }
        } else {
            let (raw, remaining) = split_unescaped(rest);
            value = raw.trim().to_string();
            rest = remaining.trim_start();
        }

        entries.push((name.to_string(), value));
    }

    Ok(AttributeList { entries })
}

/// Split at the first comma not preceded by a backslash, unescaping `\,`.
fn split_unescaped(input: &str) -> (String, &str) {
    let mut value = String::new();
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some((_, ','))) => {
                value.push(',');
                chars.next();
            }
            ',' => return (value, &input[i + 1..]),
            _ => value.push(c),
        }
    }
    (value, "")
}
