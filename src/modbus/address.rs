//! Address resolution for declarative property forms.
//!
//! A form carries a URI-like `href` whose trailing path segment is a logical
//! register number (in the device's documented 1-based / 5-digit convention)
//! plus a `modbus:entity` table name. Resolution classifies the register into
//! coil / single-word / double-word and produces the zero-based wire address
//! handed to the transport.

use serde::{Deserialize, Deserializer, Serialize};

use crate::config::AddressSpace;
use crate::error::{Result, ServientError};

/// WoT operation verbs a form can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "readproperty")]
    ReadProperty,
    #[serde(rename = "writeproperty")]
    WriteProperty,
    #[serde(rename = "observeproperty")]
    ObserveProperty,
}

/// Declarative access descriptor bound to one device property.
///
/// Parsed once at startup from the device description; the raw `POST /api/plc`
/// endpoint also deserializes ad hoc instances per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessForm {
    /// e.g. `modbus+tcp://10.0.9.40:502/1/400701?quantity=2`
    pub href: String,

    /// Register table name, matched against the configured address space
    #[serde(rename = "modbus:entity")]
    pub entity: String,

    /// Allowed operations; a bare string is accepted as a one-element list
    #[serde(deserialize_with = "one_or_many")]
    pub op: Vec<Operation>,

    /// Sampling interval in seconds for observable properties
    #[serde(rename = "modbus:pollingTime", default, skip_serializing_if = "Option::is_none")]
    pub polling_time: Option<u64>,

    /// Multiplicative scale applied to decoded read values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

impl AccessForm {
    pub fn allows(&self, op: Operation) -> bool {
        self.op.contains(&op)
    }

    pub fn scale(&self) -> f64 {
        self.scale.unwrap_or(1.0)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<Operation>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Operation),
        Many(Vec<Operation>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(op) => vec![op],
        OneOrMany::Many(ops) => ops,
    })
}

/// Register class, checked in fixed precedence order (coil, single, double).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterClass {
    Coil,
    SingleWord,
    DoubleWord,
}

impl RegisterClass {
    /// Documented address convention: coils are 1-based, holding registers
    /// use the 5-digit 4xxxxx convention.
    pub fn address_offset(self) -> u32 {
        match self {
            RegisterClass::Coil => 1,
            RegisterClass::SingleWord | RegisterClass::DoubleWord => 400_001,
        }
    }

    /// Physical registers occupied by one logical value.
    pub fn registers_per_value(self) -> u32 {
        match self {
            RegisterClass::DoubleWord => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterClass::Coil => write!(f, "coil"),
            RegisterClass::SingleWord => write!(f, "single word"),
            RegisterClass::DoubleWord => write!(f, "double word"),
        }
    }
}

/// One resolved register operation target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterTarget {
    pub class: RegisterClass,
    /// Logical register number as written in the href
    pub register: u32,
    /// Zero-based address passed to the transport
    pub wire_address: u16,
    pub scale: f64,
}

/// Parses the href and returns `(base_register, quantity)`.
///
/// The trailing path segment is the base register; an optional `quantity`
/// query parameter defaults to 1.
pub fn parse_href(href: &str) -> Result<(u32, u16)> {
    let unresolved = || ServientError::address(format!("cannot parse register from href '{href}'"));

    let (path, query) = match href.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (href, None),
    };

    let register = path
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(unresolved)?;

    let mut quantity: u16 = 1;
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == "quantity" {
                    quantity = value.parse().map_err(|_| {
                        ServientError::address(format!("invalid quantity in href '{href}'"))
                    })?;
                }
            }
        }
    }
    if quantity == 0 {
        return Err(ServientError::address(format!(
            "quantity must be at least 1 in href '{href}'"
        )));
    }

    Ok((register, quantity))
}

fn classify(entity: &str, register: u32, space: &AddressSpace) -> Result<RegisterClass> {
    // Coil classification is by table name alone; the numeric ranges only
    // partition the holding-register table.
    if entity == space.coil_table {
        return Ok(RegisterClass::Coil);
    }
    if entity == space.holding_register_table {
        if space.single_word.contains(register) {
            return Ok(RegisterClass::SingleWord);
        }
        if space.double_word.contains(register) {
            return Ok(RegisterClass::DoubleWord);
        }
    }
    Err(ServientError::address(format!(
        "register {register} in table '{entity}' is outside every configured range"
    )))
}

fn wire_address(class: RegisterClass, register: u32) -> Result<u16> {
    let offset = class.address_offset();
    register
        .checked_sub(offset)
        .and_then(|a| u16::try_from(a).ok())
        .ok_or_else(|| {
            ServientError::address(format!(
                "register {register} does not fit the {class} address space (offset {offset})"
            ))
        })
}

/// Resolves the form's register at the given 0-based value index.
///
/// Successive double-word values occupy two physical registers each, so the
/// per-index stride is `registers_per_value`: `base + index * stride`.
pub fn resolve(form: &AccessForm, space: &AddressSpace, index: u32) -> Result<RegisterTarget> {
    let (base, _) = parse_href(&form.href)?;
    let class = classify(&form.entity, base, space)?;
    let register = base + index * class.registers_per_value();

    // Every physical register of a multi-value read must itself fall inside
    // the class range; walking off the end of a range is an error, not a
    // silent reclassification.
    let resolved = classify(&form.entity, register, space)?;
    if resolved != class {
        return Err(ServientError::address(format!(
            "register {register} at index {index} crosses from {class} into {resolved}"
        )));
    }

    Ok(RegisterTarget {
        class,
        register,
        wire_address: wire_address(class, register)?,
        scale: form.scale(),
    })
}

/// Expands the form into one target per requested value, in request order.
pub fn targets(form: &AccessForm, space: &AddressSpace) -> Result<Vec<RegisterTarget>> {
    let (_, quantity) = parse_href(&form.href)?;
    (0..u32::from(quantity))
        .map(|index| resolve(form, space, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterRange;

    fn space() -> AddressSpace {
        AddressSpace {
            coil_table: "Coil".to_string(),
            holding_register_table: "HoldingRegister".to_string(),
            single_word: RegisterRange { start: 400_001, end: 404_500 },
            double_word: RegisterRange { start: 416_385, end: 418_383 },
        }
    }

    fn form(href: &str, entity: &str) -> AccessForm {
        AccessForm {
            href: href.to_string(),
            entity: entity.to_string(),
            op: vec![Operation::ReadProperty],
            polling_time: None,
            scale: None,
        }
    }

    #[test]
    fn parses_register_and_default_quantity() {
        let (register, quantity) = parse_href("modbus+tcp://10.0.9.40:502/1/400701").unwrap();
        assert_eq!(register, 400_701);
        assert_eq!(quantity, 1);
    }

    #[test]
    fn parses_quantity_query_parameter() {
        let (register, quantity) =
            parse_href("modbus+tcp://10.0.9.40:502/1/416385?quantity=4").unwrap();
        assert_eq!(register, 416_385);
        assert_eq!(quantity, 4);
    }

    #[test]
    fn rejects_non_numeric_register() {
        assert!(parse_href("modbus+tcp://10.0.9.40:502/1/abc").is_err());
        assert!(parse_href("modbus+tcp://10.0.9.40:502/1/").is_err());
    }

    #[test]
    fn single_word_wire_address_subtracts_holding_offset() {
        let target = resolve(&form(".../400701", "HoldingRegister"), &space(), 0).unwrap();
        assert_eq!(target.class, RegisterClass::SingleWord);
        assert_eq!(target.wire_address, 700);
    }

    #[test]
    fn every_single_word_register_resolves_within_range() {
        let space = space();
        for register in [400_001u32, 400_701, 404_500] {
            let target =
                resolve(&form(&format!(".../{register}"), "HoldingRegister"), &space, 0).unwrap();
            assert_eq!(target.class, RegisterClass::SingleWord);
            assert_eq!(u32::from(target.wire_address), register - 400_001);
        }
    }

    #[test]
    fn coil_addresses_are_one_based() {
        let target = resolve(&form(".../5", "Coil"), &space(), 0).unwrap();
        assert_eq!(target.class, RegisterClass::Coil);
        assert_eq!(target.wire_address, 4);
    }

    #[test]
    fn double_word_targets_stride_by_two() {
        let targets = targets(&form(".../416385?quantity=3", "HoldingRegister"), &space()).unwrap();
        let addresses: Vec<u16> = targets.iter().map(|t| t.wire_address).collect();
        assert_eq!(addresses, vec![16_384, 16_386, 16_388]);
        assert!(targets.iter().all(|t| t.class == RegisterClass::DoubleWord));
    }

    #[test]
    fn single_word_targets_stride_by_one() {
        let targets = targets(&form(".../400701?quantity=3", "HoldingRegister"), &space()).unwrap();
        let addresses: Vec<u16> = targets.iter().map(|t| t.wire_address).collect();
        assert_eq!(addresses, vec![700, 701, 702]);
    }

    #[test]
    fn register_outside_every_range_is_unresolved() {
        let err = resolve(&form(".../500000", "HoldingRegister"), &space(), 0).unwrap_err();
        assert!(matches!(err, ServientError::AddressUnresolved(_)));
    }

    #[test]
    fn unknown_table_is_unresolved() {
        let err = resolve(&form(".../400701", "InputRegister"), &space(), 0).unwrap_err();
        assert!(matches!(err, ServientError::AddressUnresolved(_)));
    }

    #[test]
    fn multi_read_crossing_range_end_is_rejected() {
        // 404500 is the last single-word register; index 1 would leave the range.
        let err = targets(&form(".../404500?quantity=2", "HoldingRegister"), &space()).unwrap_err();
        assert!(matches!(err, ServientError::AddressUnresolved(_)));
    }

    #[test]
    fn coil_classification_ignores_numeric_range() {
        // Coils sit below every configured holding range and still resolve.
        let target = resolve(&form(".../1", "Coil"), &space(), 0).unwrap();
        assert_eq!(target.wire_address, 0);
    }

    #[test]
    fn op_accepts_string_or_array() {
        let single: AccessForm =
            serde_json::from_value(serde_json::json!({
                "href": ".../5", "modbus:entity": "Coil", "op": "readproperty"
            }))
            .unwrap();
        assert_eq!(single.op, vec![Operation::ReadProperty]);

        let many: AccessForm = serde_json::from_value(serde_json::json!({
            "href": ".../5", "modbus:entity": "Coil",
            "op": ["readproperty", "writeproperty"]
        }))
        .unwrap();
        assert!(many.allows(Operation::WriteProperty));
    }
}
