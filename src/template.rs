use crate::error::ConfigError;
use std::collections::BTreeMap;

/// Named values substituted into `{name}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    values: BTreeMap<&'static str, String>,
}
impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: impl ToString) -> Self {
        self.values.insert(name, value.to_string());
        self
    }

    pub fn set(&mut self, name: &'static str, value: impl ToString) {
        self.values.insert(name, value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Renders `template`, replacing every `{name}` with its value. `{{` and `}}` produce
    /// literal braces. A placeholder without a value is an error.
    pub fn render(&self, template: &str) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(ConfigError::MalformedTemplate(template.to_string())),
                        }
                    }
                    let value = self.get(&name).ok_or_else(|| ConfigError::UnknownPlaceholder {
                        name: name.clone(),
                        template: template.to_string(),
                    })?;
                    out.push_str(value);
                }
                '}' => return Err(ConfigError::MalformedTemplate(template.to_string())),
                c => out.push(c),
            }
        }

        Ok(out)
    }
}
