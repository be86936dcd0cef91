//! Result directives: per-result-category reporting instructions.
//!
//! A directive table holds one slot per result category and answers two
//! questions for each: is this category reported at all, and at which
//! content level (thin or full). The table round-trips through an XML
//! fragment; parsing is tolerant — unrecognized content levels produce a
//! warning and fall back to full, an absent `content` attribute means
//! full.

use std::io::Cursor;

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::DirectiveError;

// ---------------------------------------------------------------------------
// Categories and content levels
// ---------------------------------------------------------------------------

/// One-hot result category bits, combinable into masks for bulk updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCategory {
    True = 0x01,
    False = 0x02,
    Unknown = 0x04,
    Error = 0x08,
    NotEvaluated = 0x10,
    NotApplicable = 0x20,
}

/// Every category, in table order.
pub const ALL_CATEGORIES: [ResultCategory; 6] = [
    ResultCategory::True,
    ResultCategory::False,
    ResultCategory::Unknown,
    ResultCategory::Error,
    ResultCategory::NotEvaluated,
    ResultCategory::NotApplicable,
];

impl ResultCategory {
    /// Slot index in the directive table.
    fn index(self) -> usize {
        match self {
            ResultCategory::True => 0,
            ResultCategory::False => 1,
            ResultCategory::Unknown => 2,
            ResultCategory::Error => 3,
            ResultCategory::NotEvaluated => 4,
            ResultCategory::NotApplicable => 5,
        }
    }

    /// Element name used in the XML form.
    pub fn element_name(self) -> &'static str {
        match self {
            ResultCategory::True => "definition-true",
            ResultCategory::False => "definition-false",
            ResultCategory::Unknown => "definition-unknown",
            ResultCategory::Error => "definition-error",
            ResultCategory::NotEvaluated => "definition-not-evaluated",
            ResultCategory::NotApplicable => "definition-not-applicable",
        }
    }

    fn from_element_name(name: &[u8]) -> Option<ResultCategory> {
        ALL_CATEGORIES
            .iter()
            .copied()
            .find(|c| c.element_name().as_bytes() == name)
    }
}

/// How much detail a reported category carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentLevel {
    Thin,
    #[default]
    Full,
    /// Parser saw a level it does not know; treated as full when applied.
    Unknown,
}

impl ContentLevel {
    fn as_attr(self) -> &'static str {
        match self {
            ContentLevel::Thin => "thin",
            ContentLevel::Full | ContentLevel::Unknown => "full",
        }
    }
}

// ---------------------------------------------------------------------------
// Directive table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Slot {
    reported: bool,
    content: ContentLevel,
}

/// Reporting instructions, one slot per result category.
///
/// The default reports every category at full content.
#[derive(Debug, Clone)]
pub struct DirectiveTable {
    slots: [Slot; 6],
}

impl Default for DirectiveTable {
    fn default() -> Self {
        Self {
            slots: [Slot { reported: true, content: ContentLevel::Full }; 6],
        }
    }
}

impl DirectiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported(&self, category: ResultCategory) -> bool {
        self.slots[category.index()].reported
    }

    pub fn content(&self, category: ResultCategory) -> ContentLevel {
        self.slots[category.index()].content
    }

    pub fn set_reported(&mut self, category: ResultCategory, reported: bool) {
        self.slots[category.index()].reported = reported;
    }

    pub fn set_content(&mut self, category: ResultCategory, content: ContentLevel) {
        self.slots[category.index()].content = content;
    }

    /// Set the reported bit for every category whose bit is in `mask`.
    pub fn set_reported_mask(&mut self, mask: u32, reported: bool) {
        for cat in ALL_CATEGORIES {
            if mask & cat as u32 != 0 {
                self.set_reported(cat, reported);
            }
        }
    }

    /// Set the content level for every category whose bit is in `mask`.
    pub fn set_content_mask(&mut self, mask: u32, content: ContentLevel) {
        for cat in ALL_CATEGORIES {
            if mask & cat as u32 != 0 {
                self.set_content(cat, content);
            }
        }
    }

    // -----------------------------------------------------------------------
    // XML round trip
    // -----------------------------------------------------------------------

    /// Parse a `<directives>` fragment.
    ///
    /// Returns the table plus one warning per tolerated irregularity.
    /// Unknown child elements are skipped; an unrecognized `content`
    /// attribute value yields a warning and the slot is set to
    /// [`ContentLevel::Unknown`], which serializes and applies as full.
    pub fn parse(input: &str) -> Result<(DirectiveTable, Vec<String>), DirectiveError> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(true);

        let mut table = DirectiveTable::default();
        let mut warnings = Vec::new();

        loop {
            let event = reader
                .read_event()
                .map_err(|e| DirectiveError::Xml { message: e.to_string() })?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let Some(cat) = ResultCategory::from_element_name(e.name().as_ref()) else {
                        continue;
                    };

                    let reported = match e
                        .try_get_attribute("reported")
                        .map_err(|err| DirectiveError::Xml { message: err.to_string() })?
                    {
                        Some(attr) => {
                            let value = attr
                                .unescape_value()
                                .map_err(|err| DirectiveError::Xml {
                                    message: err.to_string(),
                                })?;
                            matches!(value.as_ref(), "1" | "true")
                        }
                        None => false,
                    };
                    table.set_reported(cat, reported);

                    let content = match e
                        .try_get_attribute("content")
                        .map_err(|err| DirectiveError::Xml { message: err.to_string() })?
                    {
                        Some(attr) => {
                            let value = attr
                                .unescape_value()
                                .map_err(|err| DirectiveError::Xml {
                                    message: err.to_string(),
                                })?;
                            match value.as_ref() {
                                "thin" => ContentLevel::Thin,
                                "full" => ContentLevel::Full,
                                other => {
                                    warnings.push(format!(
                                        "unrecognized content level '{other}' on {}",
                                        cat.element_name()
                                    ));
                                    ContentLevel::Unknown
                                }
                            }
                        }
                        None => ContentLevel::Full,
                    };
                    table.set_content(cat, content);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok((table, warnings))
    }

    /// Serialize to a `<directives>` fragment, slots in table order.
    pub fn serialize(&self) -> Result<String, DirectiveError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer
            .write_event(Event::Start(BytesStart::new("directives")))
            .map_err(|e| DirectiveError::Xml { message: e.to_string() })?;

        for cat in ALL_CATEGORIES {
            let slot = self.slots[cat.index()];
            let mut elem = BytesStart::new(cat.element_name());
            elem.push_attribute(("reported", if slot.reported { "true" } else { "false" }));
            elem.push_attribute(("content", slot.content.as_attr()));
            writer
                .write_event(Event::Empty(elem))
                .map_err(|e| DirectiveError::Xml { message: e.to_string() })?;
        }

        writer
            .write_event(Event::End(quick_xml::events::BytesEnd::new("directives")))
            .map_err(|e| DirectiveError::Xml { message: e.to_string() })?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| DirectiveError::Xml { message: e.to_string() })
    }
}
