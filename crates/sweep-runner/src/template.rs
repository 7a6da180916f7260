//! `{name}` / `{name[index]}` placeholder substitution.

use std::collections::BTreeMap;

use crate::error::{SweepError, SweepResult};
use crate::sequence::Scalar;

#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Scalar(Scalar),
    List(Vec<Scalar>),
}

/// Names visible to a template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    values: BTreeMap<String, Binding>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Scalar) {
        self.values.insert(name.into(), Binding::Scalar(value));
    }

    pub fn insert_list(&mut self, name: impl Into<String>, values: Vec<Scalar>) {
        self.values.insert(name.into(), Binding::List(values));
    }

    pub fn extend(&mut self, other: &Bindings) {
        for (k, v) in other.values.iter() {
            self.values.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Substitutes every placeholder in `template`. `{{` and `}}` produce
    /// literal braces; everything else is copied through.
    pub fn render(&self, template: &str) -> SweepResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '{' => {
                    let mut placeholder = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        placeholder.push(c);
                    }
                    if !closed {
                        return Err(SweepError::config(format!(
                            "unterminated placeholder in template \"{}\"",
                            template
                        )));
                    }
                    out.push_str(&self.lookup(&placeholder, template)?.to_string());
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    fn lookup(&self, placeholder: &str, template: &str) -> SweepResult<&Scalar> {
        let unresolved = || SweepError::UnresolvedReference {
            reference: placeholder.to_string(),
            template: template.to_string(),
        };
        let (name, index) = match placeholder.split_once('[') {
            Some((name, rest)) => {
                let idx = rest
                    .strip_suffix(']')
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .ok_or_else(unresolved)?;
                (name, Some(idx))
            }
            None => (placeholder, None),
        };
        match (self.values.get(name.trim()), index) {
            (Some(Binding::Scalar(value)), None) => Ok(value),
            (Some(Binding::List(values)), Some(idx)) => values.get(idx).ok_or_else(unresolved),
            _ => Err(unresolved()),
        }
    }
}
