//! Weaver configuration, parsed from the build tool's XML fragment.
//!
//! The configuration is one element whose attributes are the options; unknown
//! attributes and unknown values are hard errors that name the offender and the
//! allowed set, so a typo never silently changes behavior.

use std::str::FromStr;

use quick_xml::events::Event;
use quick_xml::Reader;
use strum::{EnumString, IntoStaticStr, VariantNames};

use crate::{Error, Result};

/// What to report when a module contains nothing to precompile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, IntoStaticStr, VariantNames)]
pub enum NoOpBehavior {
    /// Emit a build warning
    #[default]
    Warn,
    /// Say nothing
    Silent,
}

/// Which constant-pattern call sites are eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, IntoStaticStr, VariantNames)]
pub enum IncludeFilter {
    /// Every recognized site
    #[default]
    All,
    /// Only sites that asked for `RegexOptions.Compiled`
    Compiled,
}

/// Parsed weaver options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options {
    /// Behavior when nothing is woven
    pub no_op_behavior: NoOpBehavior,
    /// Call-site eligibility filter
    pub include: IncludeFilter,
}

impl Options {
    /// Parse options from the tool's XML configuration element.
    ///
    /// An empty or self-closing element yields the defaults.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for unknown attributes or values, naming
    /// the offender and the allowed set.
    pub fn from_xml(config: &str) -> Result<Self> {
        let mut reader = Reader::from_str(config);
        let mut options = Options::default();

        loop {
            match reader.read_event() {
                Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                    for attribute in element.attributes() {
                        let attribute = attribute.map_err(|e| {
                            Error::Configuration(format!("malformed attribute: {e}"))
                        })?;
                        let key = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
                        let value = attribute.unescape_value().map_err(|e| {
                            Error::Configuration(format!("malformed attribute value: {e}"))
                        })?;
                        options.apply(&key, &value)?;
                    }
                    // Only the root element carries options.
                    break;
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::Configuration(format!("invalid configuration XML: {e}")))
                }
            }
        }

        Ok(options)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "NoOpBehavior" => {
                self.no_op_behavior = NoOpBehavior::from_str(value).map_err(|_| {
                    Error::Configuration(unexpected_value(
                        "NoOpBehavior",
                        value,
                        NoOpBehavior::VARIANTS,
                    ))
                })?;
            }
            "Include" => {
                self.include = IncludeFilter::from_str(value).map_err(|_| {
                    Error::Configuration(unexpected_value("Include", value, IncludeFilter::VARIANTS))
                })?;
            }
            other => {
                return Err(Error::Configuration(format!(
                    "Unexpected attribute '{other}': expected one of [NoOpBehavior, Include]"
                )))
            }
        }
        Ok(())
    }
}

fn unexpected_value(key: &str, value: &str, allowed: &[&str]) -> String {
    format!(
        "Unexpected {key} value '{value}': expected one of [{}]",
        allowed.join(", ")
    )
}
