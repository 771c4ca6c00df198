//! Run-metadata import
//!
//! On every `pre_flush`, copies name/value metadata about the run (job size,
//! problem parameters, versions, ...) into channel globals, so every snapshot
//! taken afterwards carries it. Each name becomes a GLOBAL attribute whose
//! metadata records the value's type description, category and subcategory.

use log::{info, warn};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::attribute::{AttrFlags, AttrType, Attribute, Value};
use crate::channel::{Channel, Instrumentation};

const SERVICE: &str = "metadata";

/// Metadata category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category(pub u32);

impl Category {
    /// Every category
    pub const ALL: Category = Category(1);
    pub const GENERAL: Category = Category(2);
    pub const PERFORMANCE: Category = Category(3);
    /// Tool-control settings; never imported
    pub const CONTROL: Category = Category(4);
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Category::ALL => f.write_str("all"),
            Category::GENERAL => f.write_str("general"),
            Category::PERFORMANCE => f.write_str("performance"),
            Category::CONTROL => f.write_str("control"),
            Category(n) => write!(f, "category {n}"),
        }
    }
}

/// A metadata value as published by the run
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    /// Withdraws a previously published value
    Unset,
    Long(i64),
    Ulong(u64),
    Int(i32),
    Uint(u32),
    Double(f64),
    /// Seconds since the epoch
    Date(u64),
    /// Time value as seconds + microseconds
    Timeval { secs: u64, micros: u32 },
    Version(String),
    Str(String),
    CatString(String),
    Path(String),
    Range(Box<MetaValue>, Box<MetaValue>),
    Set(Vec<MetaValue>),
    List(Vec<MetaValue>),
    Tuple(Vec<MetaValue>),
    /// A type this importer does not understand
    Unknown(String),
}

impl MetaValue {
    /// Type description stored as `meta.type`
    #[must_use]
    pub fn type_name(&self) -> String {
        let element = |items: &[MetaValue]| items.first().map_or_else(|| "unknown".to_string(), MetaValue::type_name);
        match self {
            MetaValue::Unset => "unset".to_string(),
            MetaValue::Long(_) => "long".to_string(),
            MetaValue::Ulong(_) => "unsigned long".to_string(),
            MetaValue::Int(_) => "int".to_string(),
            MetaValue::Uint(_) => "unsigned int".to_string(),
            MetaValue::Double(_) => "double".to_string(),
            MetaValue::Date(_) => "date".to_string(),
            MetaValue::Timeval { .. } => "timeval".to_string(),
            MetaValue::Version(_) => "version".to_string(),
            MetaValue::Str(_) => "string".to_string(),
            MetaValue::CatString(_) => "catstring".to_string(),
            MetaValue::Path(_) => "path".to_string(),
            MetaValue::Range(lo, _) => format!("range of {}", lo.type_name()),
            MetaValue::Set(items) => format!("set of {}", element(items)),
            MetaValue::List(items) => format!("list of {}", element(items)),
            MetaValue::Tuple(items) => {
                let types: Vec<_> = items.iter().map(MetaValue::type_name).collect();
                format!("tuple of ({})", types.join(","))
            }
            MetaValue::Unknown(name) => name.clone(),
        }
    }

    /// Channel value for this metadata value; `None` for unknown types.
    /// Compound values are rendered as strings.
    fn to_value(&self) -> Option<Value> {
        let value = match self {
            MetaValue::Long(v) => Value::Int(*v),
            MetaValue::Int(v) => Value::from(*v),
            MetaValue::Ulong(v) | MetaValue::Date(v) => Value::Uint(*v),
            MetaValue::Uint(v) => Value::from(*v),
            MetaValue::Double(v) => Value::Double(*v),
            MetaValue::Timeval { secs, micros } => Value::Double(timeval_secs(*secs, *micros)),
            MetaValue::Version(s) | MetaValue::Str(s) | MetaValue::CatString(s) | MetaValue::Path(s) => {
                Value::from(s.as_str())
            }
            MetaValue::Range(..) | MetaValue::Set(_) | MetaValue::List(_) | MetaValue::Tuple(_) => {
                let mut out = String::new();
                self.render(&mut out)?;
                Value::from(out)
            }
            MetaValue::Unset | MetaValue::Unknown(_) => return None,
        };
        Some(value)
    }

    /// Append the textual form to `out`; `None` if an unknown type is nested inside
    fn render(&self, out: &mut String) -> Option<()> {
        let _ = match self {
            MetaValue::Long(v) => write!(out, "{v}"),
            MetaValue::Int(v) => write!(out, "{v}"),
            MetaValue::Ulong(v) | MetaValue::Date(v) => write!(out, "{v}"),
            MetaValue::Uint(v) => write!(out, "{v}"),
            MetaValue::Double(v) => write!(out, "{v}"),
            MetaValue::Timeval { secs, micros } => write!(out, "{}", timeval_secs(*secs, *micros)),
            MetaValue::Version(s) | MetaValue::Str(s) | MetaValue::CatString(s) | MetaValue::Path(s) => {
                out.write_str(s)
            }
            MetaValue::Range(lo, hi) => {
                lo.render(out)?;
                out.push('-');
                return hi.render(out);
            }
            MetaValue::Set(items) => return render_seq(out, items, '[', ']'),
            MetaValue::List(items) => return render_seq(out, items, '{', '}'),
            MetaValue::Tuple(items) => return render_seq(out, items, '(', ')'),
            MetaValue::Unset | MetaValue::Unknown(_) => return None,
        };
        Some(())
    }
}

#[allow(clippy::cast_precision_loss)]
fn timeval_secs(secs: u64, micros: u32) -> f64 {
    secs as f64 + f64::from(micros) / 1_000_000.0
}

fn render_seq(out: &mut String, items: &[MetaValue], open: char, close: char) -> Option<()> {
    out.push(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        item.render(out)?;
    }
    out.push(close);
    Some(())
}

/// One published name/value pair
#[derive(Debug, Clone, PartialEq)]
pub struct MetaEntry {
    pub name: String,
    pub category: Category,
    /// Free-form grouping; empty if none
    pub subcategory: String,
    pub value: MetaValue,
}

/// Something that publishes run metadata
pub trait MetadataSource: Send + Sync {
    /// Call `visit` for every entry in `category` (every entry for [`Category::ALL`])
    fn visit(&self, category: Category, visit: &mut dyn FnMut(&MetaEntry));
}

/// In-memory metadata store; the latest value per name wins
#[derive(Debug, Default)]
pub struct MetadataTable {
    entries: Mutex<Vec<MetaEntry>>,
}

impl MetadataTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<MetaEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `value` under `name`
    pub fn set(&self, name: &str, category: Category, subcategory: &str, value: MetaValue) {
        let entry = MetaEntry { name: name.to_string(), category, subcategory: subcategory.to_string(), value };
        let mut entries = self.entries();
        match entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    /// Withdraw the value published under `name`
    pub fn unset(&self, name: &str) {
        if let Some(entry) = self.entries().iter_mut().find(|e| e.name == name) {
            entry.value = MetaValue::Unset;
        }
    }
}

impl MetadataSource for MetadataTable {
    fn visit(&self, category: Category, visit: &mut dyn FnMut(&MetaEntry)) {
        let entries = self.entries().clone();
        for entry in entries.iter().filter(|e| category == Category::ALL || e.category == category) {
            visit(entry);
        }
    }
}

/// Run-metadata import service
pub struct MetadataService {
    instrumentation: Arc<Instrumentation>,
    source: Arc<dyn MetadataSource>,
    categories: Vec<Category>,
    meta_type: Attribute,
    meta_category: Attribute,
    meta_subcategory: Attribute,
    imported: AtomicU64,
    unknown_types: AtomicU64,
}

impl MetadataService {
    /// Subscribe the import to `channel`'s `pre_flush` event
    pub fn register(channel: &Arc<Channel>, source: Arc<dyn MetadataSource>) -> Arc<Self> {
        let instr = Arc::clone(channel.instrumentation());
        let meta_flags = AttrFlags::DEFAULT | AttrFlags::SKIP_EVENTS;
        let service = Arc::new(Self {
            meta_type: instr.create_attribute("meta.type", AttrType::Str, meta_flags, &[]),
            meta_category: instr.create_attribute("meta.category", AttrType::Int, meta_flags, &[]),
            meta_subcategory: instr.create_attribute("meta.subcategory", AttrType::Str, meta_flags, &[]),
            instrumentation: instr,
            source,
            categories: channel.config().metadata.categories.iter().copied().map(Category).collect(),
            imported: AtomicU64::new(0),
            unknown_types: AtomicU64::new(0),
        });

        {
            let service = Arc::clone(&service);
            channel.events().on_pre_flush(move |ch| {
                let count = service.import(ch);
                info!("{}: {SERVICE}: imported {count} values", ch.name());
            });
        }

        info!("{}: registered {SERVICE} service", channel.name());
        service
    }

    /// Import every configured category into `channel`'s globals; returns the number of values set
    pub fn import(&self, channel: &Channel) -> u64 {
        let mut count = 0;
        for category in &self.categories {
            self.source.visit(*category, &mut |entry: &MetaEntry| {
                if entry.category != Category::CONTROL && self.import_entry(channel, entry) {
                    count += 1;
                }
            });
        }
        self.imported.fetch_add(count, Ordering::Relaxed);
        count
    }

    fn import_entry(&self, channel: &Channel, entry: &MetaEntry) -> bool {
        if entry.value == MetaValue::Unset {
            match self.instrumentation.get_attribute(&entry.name).filter(Attribute::is_global) {
                Some(attr) => {
                    channel.unset_global(&attr);
                }
                None => warn!("{}: {SERVICE}: unset invoked for unknown key {}", channel.name(), entry.name),
            }
            return false;
        }

        let Some(value) = entry.value.to_value() else {
            self.unknown_types.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let subcategory = if entry.subcategory.is_empty() { "none" } else { entry.subcategory.as_str() };
        let metadata = [
            (self.meta_type.clone(), Value::from(entry.value.type_name())),
            (self.meta_category.clone(), Value::Int(i64::from(entry.category.0))),
            (self.meta_subcategory.clone(), Value::from(subcategory)),
        ];
        let attr = self.instrumentation.create_attribute(
            &entry.name,
            value.attr_type(),
            AttrFlags::GLOBAL | AttrFlags::SKIP_EVENTS,
            &metadata,
        );
        channel.set_global(&attr, value);
        true
    }

    /// Values imported over all flushes
    #[must_use]
    pub fn imported(&self) -> u64 {
        self.imported.load(Ordering::Relaxed)
    }

    /// Entries skipped because their type is not understood
    #[must_use]
    pub fn unknown_types(&self) -> u64 {
        self.unknown_types.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;

    fn setup(categories: Vec<u32>) -> (Arc<Channel>, Arc<MetadataTable>, Arc<MetadataService>) {
        let mut config = ChannelConfig::default();
        config.metadata.categories = categories;
        let channel = Instrumentation::new().create_channel("test", config);
        let table = Arc::new(MetadataTable::new());
        let service = MetadataService::register(&channel, table.clone());
        channel.init();
        (channel, table, service)
    }

    fn global(channel: &Channel, name: &str) -> Option<Value> {
        channel.globals().into_iter().find(|(a, _)| a.name() == name).map(|(_, v)| v)
    }

    #[test]
    fn test_compound_values_render_as_strings() {
        let range = MetaValue::Range(Box::new(MetaValue::Int(1)), Box::new(MetaValue::Int(8)));
        let set = MetaValue::Set(vec![MetaValue::Int(1), MetaValue::Int(2)]);
        let list = MetaValue::List(vec![MetaValue::Str("a".into()), MetaValue::Str("b".into())]);
        let tuple = MetaValue::Tuple(vec![MetaValue::Int(1), MetaValue::Double(0.5), MetaValue::Path("/x".into())]);

        assert_eq!(range.to_value(), Some(Value::from("1-8")));
        assert_eq!(set.to_value(), Some(Value::from("[1,2]")));
        assert_eq!(list.to_value(), Some(Value::from("{a,b}")));
        assert_eq!(tuple.to_value(), Some(Value::from("(1,0.5,/x)")));
        assert_eq!(set.type_name(), "set of int");
        assert_eq!(tuple.type_name(), "tuple of (int,double,path)");
    }

    #[test]
    fn test_scalars_map_to_typed_values() {
        assert_eq!(MetaValue::Long(-3).to_value(), Some(Value::Int(-3)));
        assert_eq!(MetaValue::Uint(7).to_value(), Some(Value::Uint(7)));
        assert_eq!(MetaValue::Date(1_700_000_000).to_value(), Some(Value::Uint(1_700_000_000)));
        assert_eq!(MetaValue::Timeval { secs: 2, micros: 500_000 }.to_value(), Some(Value::Double(2.5)));
        assert_eq!(MetaValue::Unknown("jsonstring".into()).to_value(), None);
    }

    #[test]
    fn test_pre_flush_imports_configured_categories() {
        let (channel, table, service) = setup(vec![2, 3]);
        table.set("problem.size", Category::GENERAL, "", MetaValue::Ulong(4096));
        table.set("walltime", Category::PERFORMANCE, "timing", MetaValue::Double(1.25));
        table.set("tool.verbose", Category::CONTROL, "", MetaValue::Int(1));
        table.set("user", Category(5), "", MetaValue::Str("ada".into()));

        channel.flush();

        assert_eq!(global(&channel, "problem.size"), Some(Value::Uint(4096)));
        assert_eq!(global(&channel, "walltime"), Some(Value::Double(1.25)));
        assert!(global(&channel, "tool.verbose").is_none());
        assert!(global(&channel, "user").is_none());
        assert_eq!(service.imported(), 2);

        let attr = channel.instrumentation().get_attribute("problem.size").unwrap();
        assert!(attr.is_global());
        assert_eq!(attr.meta("meta.subcategory"), Some(&Value::from("none")));
        assert_eq!(attr.meta("meta.category"), Some(&Value::Int(2)));
        assert_eq!(attr.meta("meta.type"), Some(&Value::from("unsigned long")));
    }

    #[test]
    fn test_category_all_skips_control() {
        let (channel, table, _service) = setup(vec![1]);
        table.set("user", Category(5), "", MetaValue::Str("ada".into()));
        table.set("tool.verbose", Category::CONTROL, "", MetaValue::Int(1));

        channel.flush();

        assert_eq!(global(&channel, "user"), Some(Value::from("ada")));
        assert!(global(&channel, "tool.verbose").is_none());
    }

    #[test]
    fn test_unset_removes_global() {
        let (channel, table, _service) = setup(vec![2]);
        table.set("ranks", Category::GENERAL, "", MetaValue::Int(4));
        channel.flush();
        assert!(global(&channel, "ranks").is_some());

        table.unset("ranks");
        channel.flush();
        assert!(global(&channel, "ranks").is_none());
    }

    #[test]
    fn test_unknown_types_are_counted() {
        let (channel, table, service) = setup(vec![2]);
        table.set("blob", Category::GENERAL, "", MetaValue::Unknown("jsonstring".into()));
        table.set("bad", Category::GENERAL, "", MetaValue::List(vec![MetaValue::Unknown("x".into())]));

        channel.flush();

        assert_eq!(service.unknown_types(), 2);
        assert_eq!(service.imported(), 0);
    }
}
