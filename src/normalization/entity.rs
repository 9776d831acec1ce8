use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::swapi::fetcher::RawPayload;

/// Placeholder for any missing or meaningless value. Persisted fields are never null.
pub const SENTINEL: &str = "unknown";

const NO_DATA_TOKENS: [&str; 4] = ["", "unknown", "n/a", "none"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefShape {
    Single,
    List,
}

/// One scalar column: where it comes from in the payload and what it's called in storage.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub source: &'static str,
    pub column: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct RefSpec {
    pub field: FieldSpec,
    pub shape: RefShape,
}

const fn f(source: &'static str, column: &'static str) -> FieldSpec {
    FieldSpec { source, column }
}

const fn single(name: &'static str) -> RefSpec {
    RefSpec {
        field: f(name, name),
        shape: RefShape::Single,
    }
}

const fn list(name: &'static str) -> RefSpec {
    RefSpec {
        field: f(name, name),
        shape: RefShape::List,
    }
}

const PLANET_FIELDS: &[FieldSpec] = &[
    f("name", "name"),
    f("rotation_period", "rotation_period"),
    f("orbital_period", "orbital_period"),
    f("diameter", "diameter"),
    f("climate", "climate"),
    f("gravity", "gravity"),
    f("terrain", "terrain"),
    f("surface_water", "surface_water"),
    f("population", "population"),
];
const PLANET_REFS: &[RefSpec] = &[list("residents"), list("films")];

const CHARACTER_FIELDS: &[FieldSpec] = &[
    f("name", "name"),
    f("birth_year", "birth_year"),
    f("eye_color", "eye_color"),
    f("gender", "gender"),
    f("hair_color", "hair_color"),
    f("height", "height"),
    f("mass", "mass"),
    f("skin_color", "skin_color"),
];
const CHARACTER_REFS: &[RefSpec] = &[
    single("homeworld"),
    list("films"),
    list("species"),
    list("starships"),
    list("vehicles"),
];

const STARSHIP_FIELDS: &[FieldSpec] = &[
    f("name", "name"),
    f("model", "model"),
    f("manufacturer", "manufacturer"),
    f("cost_in_credits", "cost_in_credits"),
    f("length", "length"),
    f("max_atmosphering_speed", "max_atmosphering_speed"),
    f("crew", "crew"),
    f("passengers", "passengers"),
    f("cargo_capacity", "cargo_capacity"),
    f("consumables", "consumables"),
    f("hyperdrive_rating", "hyperdrive_rating"),
    f("MGLT", "mglt"),
    f("starship_class", "starship_class"),
];

const VEHICLE_FIELDS: &[FieldSpec] = &[
    f("name", "name"),
    f("model", "model"),
    f("manufacturer", "manufacturer"),
    f("cost_in_credits", "cost_in_credits"),
    f("length", "length"),
    f("max_atmosphering_speed", "max_atmosphering_speed"),
    f("crew", "crew"),
    f("passengers", "passengers"),
    f("cargo_capacity", "cargo_capacity"),
    f("consumables", "consumables"),
    f("vehicle_class", "vehicle_class"),
];
const CRAFT_REFS: &[RefSpec] = &[list("pilots"), list("films")];

/// Descriptor driving the single generic pipeline for every collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Planet,
    Character,
    Starship,
    Vehicle,
}

impl EntityKind {
    /// Fixed pass order; not enforced by any foreign key.
    pub const PASS_ORDER: [EntityKind; 4] = [
        EntityKind::Planet,
        EntityKind::Character,
        EntityKind::Starship,
        EntityKind::Vehicle,
    ];

    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Planet => "planets",
            Self::Character => "people",
            Self::Starship => "starships",
            Self::Vehicle => "vehicles",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Planet => "planets",
            Self::Character => "characters",
            Self::Starship => "starships",
            Self::Vehicle => "vehicles",
        }
    }

    pub fn scalar_fields(self) -> &'static [FieldSpec] {
        match self {
            Self::Planet => PLANET_FIELDS,
            Self::Character => CHARACTER_FIELDS,
            Self::Starship => STARSHIP_FIELDS,
            Self::Vehicle => VEHICLE_FIELDS,
        }
    }

    pub fn reference_fields(self) -> &'static [RefSpec] {
        match self {
            Self::Planet => PLANET_REFS,
            Self::Character => CHARACTER_REFS,
            Self::Starship | Self::Vehicle => CRAFT_REFS,
        }
    }

    /// Every persisted column except `id`, in schema order.
    pub fn columns(self) -> impl Iterator<Item = &'static str> {
        self.scalar_fields()
            .iter()
            .map(|f| f.column)
            .chain(self.reference_fields().iter().map(|r| r.field.column))
    }

    /// Accepts table names, endpoints and a few singular spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "planet" | "planets" => Some(Self::Planet),
            "character" | "characters" | "people" | "person" => Some(Self::Character),
            "starship" | "starships" => Some(Self::Starship),
            "vehicle" | "vehicles" => Some(Self::Vehicle),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedEntity {
    pub kind: EntityKind,
    pub id: i64,
    pub fields: IndexMap<&'static str, String>,
}

impl NormalizedEntity {
    pub fn name(&self) -> &str {
        self.fields.get("name").map(String::as_str).unwrap_or(SENTINEL)
    }

    pub fn field(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }
}

/// Trimmed text, or the sentinel when the value carries no data.
pub fn clean_text(raw: &str) -> String {
    let trimmed = raw.trim();
    if NO_DATA_TOKENS
        .iter()
        .any(|t| trimmed.eq_ignore_ascii_case(t))
    {
        SENTINEL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn scalar_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => clean_text(s),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => SENTINEL.to_string(),
    }
}

/// Map a raw payload plus already-joined reference strings into the kind's
/// record shape. Reference columns absent from `resolved` become the sentinel.
pub fn normalize(
    kind: EntityKind,
    id: i64,
    raw: &RawPayload,
    resolved: &HashMap<&'static str, String>,
) -> NormalizedEntity {
    let mut fields = IndexMap::with_capacity(kind.columns().count());
    for spec in kind.scalar_fields() {
        fields.insert(spec.column, scalar_text(raw.get(spec.source)));
    }
    for spec in kind.reference_fields() {
        let text = resolved
            .get(spec.field.column)
            .map(|s| clean_text(s))
            .unwrap_or_else(|| SENTINEL.to_string());
        fields.insert(spec.field.column, text);
    }
    NormalizedEntity { kind, id, fields }
}
