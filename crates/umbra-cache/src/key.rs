//! Cache keys.

use umbra_proto::{Name, Question, RecordClass, RecordType};

/// Cache key: (lowercased name, type, class).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: Name,
    rtype: RecordType,
    rclass: RecordClass,
}

impl CacheKey {
    pub fn new(name: &Name, rtype: RecordType, rclass: RecordClass) -> Self {
        Self {
            name: name.lowercased(),
            rtype,
            rclass,
        }
    }

    pub fn from_question(question: &Question) -> Self {
        Self::new(&question.qname, question.qtype, question.qclass)
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn rtype(&self) -> RecordType {
        self.rtype
    }

    pub fn rclass(&self) -> RecordClass {
        self.rclass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_key_case_folding() {
        let k1 = CacheKey::new(
            &Name::from_str("Example.COM").unwrap(),
            RecordType::A,
            RecordClass::IN,
        );
        let k2 = CacheKey::new(
            &Name::from_str("example.com").unwrap(),
            RecordType::A,
            RecordClass::IN,
        );
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_key_type_distinct() {
        let name = Name::from_str("example.com").unwrap();
        let a = CacheKey::new(&name, RecordType::A, RecordClass::IN);
        let aaaa = CacheKey::new(&name, RecordType::AAAA, RecordClass::IN);
        assert_ne!(a, aaaa);
    }
}
