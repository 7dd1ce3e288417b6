// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/types.rs

// Type codes shared by values and expression nodes, handler roles,
// and the type sets used by slot constraints.

// <>

use std::fmt;

/// Tag identifying the kind of a value or an expression node
///
/// Codes below `MAXIMUM_PRIMITIVES` index the primitive-type table
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeCode(pub u16);

impl TypeCode {
    pub const FLOAT: TypeCode = TypeCode(0);
    pub const INTEGER: TypeCode = TypeCode(1);
    pub const SYMBOL: TypeCode = TypeCode(2);
    pub const STRING: TypeCode = TypeCode(3);
    pub const MULTIFIELD: TypeCode = TypeCode(4);
    pub const EXTERNAL_ADDRESS: TypeCode = TypeCode(5);
    pub const FACT_ADDRESS: TypeCode = TypeCode(6);
    pub const INSTANCE_ADDRESS: TypeCode = TypeCode(7);
    pub const INSTANCE_NAME: TypeCode = TypeCode(8);
    pub const VOID: TypeCode = TypeCode(9);
    pub const DEFCLASS_PTR: TypeCode = TypeCode(10);

    pub const FCALL: TypeCode = TypeCode(30);
    pub const SF_VARIABLE: TypeCode = TypeCode(31);
    pub const MF_VARIABLE: TypeCode = TypeCode(32);
    pub const PROC_PARAM: TypeCode = TypeCode(33);
    pub const PROC_WILD_PARAM: TypeCode = TypeCode(34);

    /// First code free for host-registered primitive types
    pub const FIRST_USER: TypeCode = TypeCode(40);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// True for kinds the evaluator copies straight out of a node
    pub fn is_constant(self) -> bool {
        matches!(
            self,
            TypeCode::FLOAT
                | TypeCode::INTEGER
                | TypeCode::SYMBOL
                | TypeCode::STRING
                | TypeCode::EXTERNAL_ADDRESS
                | TypeCode::FACT_ADDRESS
                | TypeCode::INSTANCE_ADDRESS
                | TypeCode::INSTANCE_NAME
                | TypeCode::VOID
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeCode::FLOAT => "float",
            TypeCode::INTEGER => "integer",
            TypeCode::SYMBOL => "symbol",
            TypeCode::STRING => "string",
            TypeCode::MULTIFIELD => "multifield",
            TypeCode::EXTERNAL_ADDRESS => "external-address",
            TypeCode::FACT_ADDRESS => "fact-address",
            TypeCode::INSTANCE_ADDRESS => "instance-address",
            TypeCode::INSTANCE_NAME => "instance-name",
            TypeCode::VOID => "void",
            TypeCode::DEFCLASS_PTR => "defclass-pointer",
            TypeCode::FCALL => "function-call",
            TypeCode::SF_VARIABLE => "variable",
            TypeCode::MF_VARIABLE => "multifield-variable",
            TypeCode::PROC_PARAM => "parameter",
            TypeCode::PROC_WILD_PARAM => "wildcard-parameter",
            _ => "user-type",
        }
    }
}

impl fmt::Debug for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Size of the primitive-type dispatch table
pub const MAXIMUM_PRIMITIVES: usize = 64;

/// Number of external address types an environment may register
pub const MAXIMUM_EXTERNAL_ADDRESS_TYPES: usize = 10;

/// Role of a message handler within a handler chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerRole {
    Around,
    Before,
    Primary,
    After,
}

impl HandlerRole {
    pub const ALL: [HandlerRole; 4] = [
        HandlerRole::Around,
        HandlerRole::Before,
        HandlerRole::Primary,
        HandlerRole::After,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HandlerRole::Around => "around",
            HandlerRole::Before => "before",
            HandlerRole::Primary => "primary",
            HandlerRole::After => "after",
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            HandlerRole::Around => 0,
            HandlerRole::Before => 1,
            HandlerRole::Primary => 2,
            HandlerRole::After => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(HandlerRole::Around),
            1 => Some(HandlerRole::Before),
            2 => Some(HandlerRole::Primary),
            3 => Some(HandlerRole::After),
            _ => None,
        }
    }
}

/// Bit set of value type codes, one bit per code below 32
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TypeSet(pub u32);

impl TypeSet {
    pub const EMPTY: TypeSet = TypeSet(0);

    pub fn of(codes: &[TypeCode]) -> Self {
        codes.iter().fold(TypeSet::EMPTY, |set, c| set.with(*c))
    }

    pub fn with(self, code: TypeCode) -> Self {
        if code.0 < 32 {
            TypeSet(self.0 | (1 << code.0))
        } else {
            self
        }
    }

    pub fn contains(self, code: TypeCode) -> bool {
        code.0 < 32 && self.0 & (1 << code.0) != 0
    }
}
