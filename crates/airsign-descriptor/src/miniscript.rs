//! Miniscript: parsing, type checking and compilation to Script.
//!
//! # Types and properties
//!
//! Every node has a basic type (`B`, `K`, `V` or `W`) and a set of
//! properties drawn from `z o n d u`, computed bottom-up when the node is
//! built. [`Miniscript::verify`] checks the composition rules of every
//! fragment; [`Miniscript::compile`] refuses to emit a script for a tree
//! that does not verify.
//!
//! # Grammar
//!
//! ```text
//! node     := [wrappers ':'] name '(' args ')' | '0' | '1'
//! wrappers := one or more of a s c t d v j n l u
//! ```
//!
//! The argument layout of each fragment comes from [`OPERATORS`].

use std::fmt;
use std::ops::{BitAnd, BitOr};

use airsign_core::script::{push_data, push_number, Script};
use thiserror::Error;

use crate::cursor::Cursor;
use crate::key::{ArgumentError, DescriptorKey};

const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;
const OP_IF: u8 = 0x63;
const OP_NOTIF: u8 = 0x64;
const OP_ELSE: u8 = 0x67;
const OP_ENDIF: u8 = 0x68;
const OP_VERIFY: u8 = 0x69;
const OP_TOALTSTACK: u8 = 0x6b;
const OP_FROMALTSTACK: u8 = 0x6c;
const OP_IFDUP: u8 = 0x73;
const OP_DUP: u8 = 0x76;
const OP_SWAP: u8 = 0x7c;
const OP_SIZE: u8 = 0x82;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_0NOTEQUAL: u8 = 0x92;
const OP_ADD: u8 = 0x93;
const OP_BOOLAND: u8 = 0x9a;
const OP_BOOLOR: u8 = 0x9b;
const OP_NUMEQUAL: u8 = 0x9c;
const OP_RIPEMD160: u8 = 0xa6;
const OP_SHA256: u8 = 0xa8;
const OP_HASH160: u8 = 0xa9;
const OP_HASH256: u8 = 0xaa;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;

/// Largest key count accepted by `multi`/`sortedmulti`.
pub const MAX_MULTISIG_KEYS: usize = 20;

const LOCKTIME_LIMIT: u32 = 0x8000_0000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MiniscriptError {
    #[error("Unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("Unknown wrapper '{0}'")]
    UnknownWrapper(char),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("{fragment}: {reason}")]
    Type {
        fragment: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Argument(#[from] ArgumentError),
}

/// Basic type of a miniscript expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    B,
    K,
    V,
    W,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Type::B => "B",
            Type::K => "K",
            Type::V => "V",
            Type::W => "W",
        };
        f.write_str(c)
    }
}

/// Set over the `z o n d u` properties.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Props(u8);

impl Props {
    pub const EMPTY: Props = Props(0);
    /// Consumes exactly 0 stack elements.
    pub const Z: Props = Props(1);
    /// Consumes exactly 1 stack element.
    pub const O: Props = Props(1 << 1);
    /// Nonzero: satisfaction never needs a zero top element.
    pub const N: Props = Props(1 << 2);
    /// Dissatisfiable.
    pub const D: Props = Props(1 << 3);
    /// Unit: leaves exactly 1 on satisfaction.
    pub const U: Props = Props(1 << 4);

    pub const fn contains(self, other: Props) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn has(self, other: Props) -> bool {
        self.0 & other.0 != 0
    }

    fn when(cond: bool, p: Props) -> Props {
        if cond {
            p
        } else {
            Props::EMPTY
        }
    }
}

impl BitOr for Props {
    type Output = Props;
    fn bitor(self, rhs: Props) -> Props {
        Props(self.0 | rhs.0)
    }
}

impl BitAnd for Props {
    type Output = Props;
    fn bitand(self, rhs: Props) -> Props {
        Props(self.0 & rhs.0)
    }
}

impl fmt::Display for Props {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (p, c) in [
            (Props::Z, 'z'),
            (Props::O, 'o'),
            (Props::N, 'n'),
            (Props::D, 'd'),
            (Props::U, 'u'),
        ] {
            if self.has(p) {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Props {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Props({})", self)
    }
}

/// Single-letter wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wrapper {
    A,
    S,
    C,
    T,
    D,
    V,
    J,
    N,
    L,
    U,
}

impl Wrapper {
    pub fn from_char(c: char) -> Option<Wrapper> {
        Some(match c {
            'a' => Wrapper::A,
            's' => Wrapper::S,
            'c' => Wrapper::C,
            't' => Wrapper::T,
            'd' => Wrapper::D,
            'v' => Wrapper::V,
            'j' => Wrapper::J,
            'n' => Wrapper::N,
            'l' => Wrapper::L,
            'u' => Wrapper::U,
            _ => return None,
        })
    }

    pub fn as_char(self) -> char {
        match self {
            Wrapper::A => 'a',
            Wrapper::S => 's',
            Wrapper::C => 'c',
            Wrapper::T => 't',
            Wrapper::D => 'd',
            Wrapper::V => 'v',
            Wrapper::J => 'j',
            Wrapper::N => 'n',
            Wrapper::L => 'l',
            Wrapper::U => 'u',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Key,
    KeyHash,
    Number,
    Hash32,
    Hash20,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Fixed(usize),
    /// One `first` argument followed by one or more `rest` arguments.
    Variadic,
}

/// Argument layout of one fragment.
#[derive(Debug, Clone, Copy)]
struct Operator {
    name: &'static str,
    arity: Arity,
    first: ArgKind,
    rest: ArgKind,
}

const fn op(name: &'static str, arity: Arity, first: ArgKind, rest: ArgKind) -> Operator {
    Operator {
        name,
        arity,
        first,
        rest,
    }
}

const OPERATORS: &[Operator] = &[
    op("pk_k", Arity::Fixed(1), ArgKind::Key, ArgKind::Key),
    op("pk_h", Arity::Fixed(1), ArgKind::KeyHash, ArgKind::KeyHash),
    op("older", Arity::Fixed(1), ArgKind::Number, ArgKind::Number),
    op("after", Arity::Fixed(1), ArgKind::Number, ArgKind::Number),
    op("sha256", Arity::Fixed(1), ArgKind::Hash32, ArgKind::Hash32),
    op("hash256", Arity::Fixed(1), ArgKind::Hash32, ArgKind::Hash32),
    op("ripemd160", Arity::Fixed(1), ArgKind::Hash20, ArgKind::Hash20),
    op("hash160", Arity::Fixed(1), ArgKind::Hash20, ArgKind::Hash20),
    op("andor", Arity::Fixed(3), ArgKind::Node, ArgKind::Node),
    op("and_v", Arity::Fixed(2), ArgKind::Node, ArgKind::Node),
    op("and_b", Arity::Fixed(2), ArgKind::Node, ArgKind::Node),
    op("and_n", Arity::Fixed(2), ArgKind::Node, ArgKind::Node),
    op("or_b", Arity::Fixed(2), ArgKind::Node, ArgKind::Node),
    op("or_c", Arity::Fixed(2), ArgKind::Node, ArgKind::Node),
    op("or_d", Arity::Fixed(2), ArgKind::Node, ArgKind::Node),
    op("or_i", Arity::Fixed(2), ArgKind::Node, ArgKind::Node),
    op("thresh", Arity::Variadic, ArgKind::Number, ArgKind::Node),
    op("multi", Arity::Variadic, ArgKind::Number, ArgKind::Key),
    op("sortedmulti", Arity::Variadic, ArgKind::Number, ArgKind::Key),
    op("pk", Arity::Fixed(1), ArgKind::Key, ArgKind::Key),
    op("pkh", Arity::Fixed(1), ArgKind::KeyHash, ArgKind::KeyHash),
];

enum Arg {
    Key(DescriptorKey),
    Number(u32),
    Hash32([u8; 32]),
    Hash20([u8; 20]),
    Node(Miniscript),
}

/// Miniscript fragments. Wrappers are a separate variant holding the
/// wrapped node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Zero,
    One,
    PkK(DescriptorKey),
    PkH(DescriptorKey),
    Older(u32),
    After(u32),
    Sha256([u8; 32]),
    Hash256([u8; 32]),
    Ripemd160([u8; 20]),
    Hash160([u8; 20]),
    AndOr(Box<Miniscript>, Box<Miniscript>, Box<Miniscript>),
    AndV(Box<Miniscript>, Box<Miniscript>),
    AndB(Box<Miniscript>, Box<Miniscript>),
    AndN(Box<Miniscript>, Box<Miniscript>),
    OrB(Box<Miniscript>, Box<Miniscript>),
    OrC(Box<Miniscript>, Box<Miniscript>),
    OrD(Box<Miniscript>, Box<Miniscript>),
    OrI(Box<Miniscript>, Box<Miniscript>),
    Thresh(u32, Vec<Miniscript>),
    Multi(u32, Vec<DescriptorKey>),
    SortedMulti(u32, Vec<DescriptorKey>),
    Pk(DescriptorKey),
    Pkh(DescriptorKey),
    Wrap(Wrapper, Box<Miniscript>),
}

impl Fragment {
    pub fn name(&self) -> &'static str {
        match self {
            Fragment::Zero => "0",
            Fragment::One => "1",
            Fragment::PkK(_) => "pk_k",
            Fragment::PkH(_) => "pk_h",
            Fragment::Older(_) => "older",
            Fragment::After(_) => "after",
            Fragment::Sha256(_) => "sha256",
            Fragment::Hash256(_) => "hash256",
            Fragment::Ripemd160(_) => "ripemd160",
            Fragment::Hash160(_) => "hash160",
            Fragment::AndOr(..) => "andor",
            Fragment::AndV(..) => "and_v",
            Fragment::AndB(..) => "and_b",
            Fragment::AndN(..) => "and_n",
            Fragment::OrB(..) => "or_b",
            Fragment::OrC(..) => "or_c",
            Fragment::OrD(..) => "or_d",
            Fragment::OrI(..) => "or_i",
            Fragment::Thresh(..) => "thresh",
            Fragment::Multi(..) => "multi",
            Fragment::SortedMulti(..) => "sortedmulti",
            Fragment::Pk(_) => "pk",
            Fragment::Pkh(_) => "pkh",
            Fragment::Wrap(..) => "wrapper",
        }
    }

    fn from_args(name: &'static str, args: Vec<Arg>) -> Result<Fragment, MiniscriptError> {
        let mut args = args.into_iter();
        let mut next = || {
            args.next()
                .ok_or_else(|| MiniscriptError::Parse(format!("{}: missing argument", name)))
        };
        let bad = || MiniscriptError::Parse(format!("{}: unexpected argument kind", name));

        macro_rules! node {
            () => {
                match next()? {
                    Arg::Node(n) => Box::new(n),
                    _ => return Err(bad()),
                }
            };
        }
        macro_rules! key {
            () => {
                match next()? {
                    Arg::Key(k) => k,
                    _ => return Err(bad()),
                }
            };
        }
        macro_rules! number {
            () => {
                match next()? {
                    Arg::Number(n) => n,
                    _ => return Err(bad()),
                }
            };
        }
        macro_rules! hash32 {
            () => {
                match next()? {
                    Arg::Hash32(h) => h,
                    _ => return Err(bad()),
                }
            };
        }
        macro_rules! hash20 {
            () => {
                match next()? {
                    Arg::Hash20(h) => h,
                    _ => return Err(bad()),
                }
            };
        }

        let fragment = match name {
            "pk_k" => Fragment::PkK(key!()),
            "pk_h" => Fragment::PkH(key!()),
            "older" => Fragment::Older(number!()),
            "after" => Fragment::After(number!()),
            "sha256" => Fragment::Sha256(hash32!()),
            "hash256" => Fragment::Hash256(hash32!()),
            "ripemd160" => Fragment::Ripemd160(hash20!()),
            "hash160" => Fragment::Hash160(hash20!()),
            "andor" => Fragment::AndOr(node!(), node!(), node!()),
            "and_v" => Fragment::AndV(node!(), node!()),
            "and_b" => Fragment::AndB(node!(), node!()),
            "and_n" => Fragment::AndN(node!(), node!()),
            "or_b" => Fragment::OrB(node!(), node!()),
            "or_c" => Fragment::OrC(node!(), node!()),
            "or_d" => Fragment::OrD(node!(), node!()),
            "or_i" => Fragment::OrI(node!(), node!()),
            "thresh" => {
                let k = number!();
                let mut subs = Vec::new();
                for arg in args {
                    match arg {
                        Arg::Node(n) => subs.push(n),
                        _ => return Err(bad()),
                    }
                }
                Fragment::Thresh(k, subs)
            }
            "multi" | "sortedmulti" => {
                let k = number!();
                let mut keys = Vec::new();
                for arg in args {
                    match arg {
                        Arg::Key(key) => keys.push(key),
                        _ => return Err(bad()),
                    }
                }
                if name == "multi" {
                    Fragment::Multi(k, keys)
                } else {
                    Fragment::SortedMulti(k, keys)
                }
            }
            "pk" => Fragment::Pk(key!()),
            "pkh" => Fragment::Pkh(key!()),
            other => return Err(MiniscriptError::UnknownOperator(other.to_string())),
        };
        Ok(fragment)
    }

    /// Type and properties from the children's, before any validity check.
    fn type_props(&self) -> (Type, Props) {
        use Props as P;
        match self {
            Fragment::Zero => (Type::B, P::Z | P::U | P::D),
            Fragment::One => (Type::B, P::Z | P::U),
            Fragment::PkK(_) => (Type::K, P::O | P::N | P::D | P::U),
            Fragment::PkH(_) => (Type::K, P::N | P::D | P::U),
            Fragment::Older(_) | Fragment::After(_) => (Type::B, P::Z),
            Fragment::Sha256(_) | Fragment::Hash256(_) | Fragment::Ripemd160(_) | Fragment::Hash160(_) => {
                (Type::B, P::O | P::N | P::D | P::U)
            }
            Fragment::Multi(..) | Fragment::SortedMulti(..) => (Type::B, P::N | P::D | P::U),
            Fragment::Pk(_) => (Type::B, P::O | P::N | P::D | P::U),
            Fragment::Pkh(_) => (Type::B, P::N | P::D | P::U),
            Fragment::AndOr(x, y, z) => (y.ty, andor_props(x.props, y.props, z.props)),
            Fragment::AndN(x, y) => {
                let (_, zero) = Fragment::Zero.type_props();
                (y.ty, andor_props(x.props, y.props, zero))
            }
            Fragment::AndV(x, y) => (y.ty, and_v_props(x.props, y.props)),
            Fragment::AndB(x, y) => {
                let (px, py) = (x.props, y.props);
                let base = and_v_props(px, py) & (P::Z | P::O | P::N);
                (Type::B, base | P::when(px.has(P::D) && py.has(P::D), P::D) | P::U)
            }
            Fragment::OrB(x, z) => {
                let (px, pz) = (x.props, z.props);
                let props = P::when(px.has(P::Z) && pz.has(P::Z), P::Z)
                    | P::when(
                        (px.has(P::Z) && pz.has(P::O)) || (pz.has(P::Z) && px.has(P::O)),
                        P::O,
                    )
                    | P::D
                    | P::U;
                (Type::B, props)
            }
            Fragment::OrC(x, z) => {
                let (px, pz) = (x.props, z.props);
                let props = P::when(px.has(P::Z) && pz.has(P::Z), P::Z)
                    | P::when(px.has(P::O) && pz.has(P::Z), P::O);
                (Type::V, props)
            }
            Fragment::OrD(x, z) => {
                let (px, pz) = (x.props, z.props);
                let props = P::when(px.has(P::Z) && pz.has(P::Z), P::Z)
                    | P::when(px.has(P::O) && pz.has(P::Z), P::O)
                    | (pz & (P::D | P::U));
                (Type::B, props)
            }
            Fragment::OrI(x, z) => {
                let (px, pz) = (x.props, z.props);
                let props = P::when(px.has(P::Z) && pz.has(P::Z), P::O)
                    | P::when(px.has(P::U) && pz.has(P::U), P::U)
                    | P::when(px.has(P::D) || pz.has(P::D), P::D);
                (x.ty, props)
            }
            Fragment::Thresh(_, subs) => {
                let all_z = subs.iter().all(|s| s.props.has(P::Z));
                let non_z: Vec<&Miniscript> = subs.iter().filter(|s| !s.props.has(P::Z)).collect();
                let one_o = non_z.len() == 1 && non_z[0].props.has(P::O);
                (
                    Type::B,
                    P::when(all_z, P::Z) | P::when(one_o, P::O) | P::D | P::U,
                )
            }
            Fragment::Wrap(w, x) => wrapper_type_props(*w, x),
        }
    }
}

fn andor_props(px: Props, py: Props, pz: Props) -> Props {
    use Props as P;
    P::when(px.has(P::Z) && py.has(P::Z) && pz.has(P::Z), P::Z)
        | P::when(
            (px.has(P::Z) && py.has(P::O) && pz.has(P::O))
                || (px.has(P::O) && py.has(P::Z) && pz.has(P::Z)),
            P::O,
        )
        | P::when(py.has(P::U) && pz.has(P::U), P::U)
        | P::when(pz.has(P::D), P::D)
}

fn and_v_props(px: Props, py: Props) -> Props {
    use Props as P;
    P::when(px.has(P::Z) && py.has(P::Z), P::Z)
        | P::when(
            (px.has(P::Z) && py.has(P::O)) || (py.has(P::Z) && px.has(P::O)),
            P::O,
        )
        | P::when(px.has(P::N) || (px.has(P::Z) && py.has(P::N)), P::N)
        | P::when(py.has(P::U), P::U)
}

fn wrapper_type_props(w: Wrapper, x: &Miniscript) -> (Type, Props) {
    use Props as P;
    let px = x.props;
    match w {
        Wrapper::A | Wrapper::S => (Type::W, px & (P::D | P::U)),
        Wrapper::C => (Type::B, (px & (P::O | P::N | P::D)) | P::U),
        // t:X is and_v(X,1)
        Wrapper::T => {
            let (_, one) = Fragment::One.type_props();
            (Type::B, and_v_props(px, one))
        }
        // u is only added in tapscript
        Wrapper::D => (Type::B, P::when(px.has(P::Z), P::O) | P::N | P::D),
        Wrapper::V => (Type::V, px & (P::Z | P::O | P::N)),
        Wrapper::J => (Type::B, (px & (P::O | P::U)) | P::N | P::D),
        Wrapper::N => (Type::B, (px & (P::Z | P::O | P::N | P::D)) | P::U),
        Wrapper::L | Wrapper::U => (
            Type::B,
            P::when(px.has(P::Z), P::O) | (px & P::U) | P::D,
        ),
    }
}

/// A typed miniscript node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Miniscript {
    fragment: Fragment,
    ty: Type,
    props: Props,
}

impl Miniscript {
    pub fn new(fragment: Fragment) -> Self {
        let (ty, props) = fragment.type_props();
        Self {
            fragment,
            ty,
            props,
        }
    }

    pub fn wrap(self, wrapper: Wrapper) -> Self {
        Self::new(Fragment::Wrap(wrapper, Box::new(self)))
    }

    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn props(&self) -> Props {
        self.props
    }

    pub fn name(&self) -> &'static str {
        self.fragment.name()
    }

    fn is_bdu(&self) -> bool {
        self.ty == Type::B && self.props.contains(Props::D | Props::U)
    }

    /// Parse a complete miniscript expression.
    pub fn parse(s: &str) -> Result<Self, MiniscriptError> {
        let mut cursor = Cursor::new(s);
        let ms = Self::parse_from(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(MiniscriptError::Parse(format!(
                "unexpected trailing input '{}'",
                cursor.rest()
            )));
        }
        Ok(ms)
    }

    pub(crate) fn parse_from(cursor: &mut Cursor<'_>) -> Result<Self, MiniscriptError> {
        let token = cursor.take_until(&['(', ',', ')']);
        let (wrappers, name) = match token.split_once(':') {
            Some((w, n)) => (w, n),
            None => ("", token),
        };
        let wrappers = wrappers
            .chars()
            .map(|c| Wrapper::from_char(c).ok_or(MiniscriptError::UnknownWrapper(c)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut node = match name {
            "0" if cursor.peek() != Some('(') => Miniscript::new(Fragment::Zero),
            "1" if cursor.peek() != Some('(') => Miniscript::new(Fragment::One),
            _ => {
                let operator = OPERATORS
                    .iter()
                    .find(|o| o.name == name)
                    .ok_or_else(|| MiniscriptError::UnknownOperator(name.to_string()))?;
                if !cursor.eat('(') {
                    return Err(MiniscriptError::Parse(format!("missing ( after {}", name)));
                }
                let args = read_arguments(cursor, operator)?;
                Miniscript::new(Fragment::from_args(operator.name, args)?)
            }
        };
        for w in wrappers.into_iter().rev() {
            node = node.wrap(w);
        }
        Ok(node)
    }

    /// Check the composition rules of every node, bottom-up.
    pub fn verify(&self) -> Result<(), MiniscriptError> {
        use Props as P;
        let name = self.name();
        let fail = |reason: &str| {
            Err(MiniscriptError::Type {
                fragment: name,
                reason: reason.to_string(),
            })
        };

        for child in self.children() {
            child.verify()?;
        }

        match &self.fragment {
            Fragment::Older(n) | Fragment::After(n) => {
                if *n < 1 || *n >= LOCKTIME_LIMIT {
                    return fail("argument must be in range [1, 0x80000000)");
                }
            }
            Fragment::Multi(k, keys) | Fragment::SortedMulti(k, keys) => {
                if keys.is_empty() || keys.len() > MAX_MULTISIG_KEYS {
                    return fail("between 1 and 20 keys are required");
                }
                if *k < 1 || *k as usize > keys.len() {
                    return fail(&format!("1 <= k <= {} is required, got {}", keys.len(), k));
                }
            }
            Fragment::AndOr(x, y, z) => {
                if !x.is_bdu() {
                    return fail("X must be Bdu");
                }
                if y.ty != z.ty || y.ty == Type::W {
                    return fail("Y and Z must both be B, K or V");
                }
            }
            Fragment::AndV(x, y) => {
                if x.ty != Type::V {
                    return fail("X must be V");
                }
                if y.ty == Type::W {
                    return fail("Y must be B, K or V");
                }
            }
            Fragment::AndB(x, y) => {
                if x.ty != Type::B || y.ty != Type::W {
                    return fail("X must be B and Y must be W");
                }
            }
            Fragment::AndN(x, y) => {
                if !x.is_bdu() {
                    return fail("X must be Bdu");
                }
                if y.ty != Type::B {
                    return fail("Y must be B");
                }
            }
            Fragment::OrB(x, z) => {
                if x.ty != Type::B || !x.props.has(P::D) {
                    return fail("X must be Bd");
                }
                if z.ty != Type::W || !z.props.has(P::D) {
                    return fail("Z must be Wd");
                }
            }
            Fragment::OrC(x, z) => {
                if !x.is_bdu() {
                    return fail("X must be Bdu");
                }
                if z.ty != Type::V {
                    return fail("Z must be V");
                }
            }
            Fragment::OrD(x, z) => {
                if !x.is_bdu() {
                    return fail("X must be Bdu");
                }
                if z.ty != Type::B {
                    return fail("Z must be B");
                }
            }
            Fragment::OrI(x, z) => {
                if x.ty != z.ty || x.ty == Type::W {
                    return fail("X and Z must both be B, K or V");
                }
            }
            Fragment::Thresh(k, subs) => {
                if *k < 1 || *k as usize > subs.len() {
                    return fail(&format!("1 <= k <= {} is required, got {}", subs.len(), k));
                }
                let (first, rest) = match subs.split_first() {
                    Some(split) => split,
                    None => return fail("at least one sub-expression is required"),
                };
                if !first.is_bdu() {
                    return fail("X1 must be Bdu");
                }
                for (i, sub) in rest.iter().enumerate() {
                    if sub.ty != Type::W || !sub.props.contains(P::D | P::U) {
                        return fail(&format!("X{} must be Wdu", i + 2));
                    }
                }
            }
            Fragment::Wrap(w, x) => {
                let ok = match w {
                    Wrapper::A | Wrapper::V | Wrapper::N | Wrapper::L | Wrapper::U => x.ty == Type::B,
                    Wrapper::S => x.ty == Type::B && x.props.has(P::O),
                    Wrapper::C => x.ty == Type::K,
                    Wrapper::T => x.ty == Type::V,
                    Wrapper::D => x.ty == Type::V && x.props.has(P::Z),
                    Wrapper::J => x.ty == Type::B && x.props.has(P::N),
                };
                if !ok {
                    return Err(MiniscriptError::Type {
                        fragment: "wrapper",
                        reason: format!("{}: invalid argument of type {}{}", w.as_char(), x.ty, x.props),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Verify, then compile to script bytes.
    pub fn compile(&self) -> Result<Script, MiniscriptError> {
        self.verify()?;
        let mut out = Vec::new();
        self.compile_into(&mut out)?;
        Ok(Script::new(out))
    }

    fn compile_into(&self, out: &mut Vec<u8>) -> Result<(), MiniscriptError> {
        match &self.fragment {
            Fragment::Zero => out.push(OP_0),
            Fragment::One => out.push(OP_1),
            Fragment::PkK(key) => key.push_key(out)?,
            Fragment::PkH(key) => {
                out.extend_from_slice(&[OP_DUP, OP_HASH160]);
                key.push_key_hash(out)?;
                out.push(OP_EQUALVERIFY);
            }
            Fragment::Older(n) => {
                push_number(out, *n as u64);
                out.push(OP_CHECKSEQUENCEVERIFY);
            }
            Fragment::After(n) => {
                push_number(out, *n as u64);
                out.push(OP_CHECKLOCKTIMEVERIFY);
            }
            Fragment::Sha256(h) => compile_hash(out, OP_SHA256, h),
            Fragment::Hash256(h) => compile_hash(out, OP_HASH256, h),
            Fragment::Ripemd160(h) => compile_hash(out, OP_RIPEMD160, h),
            Fragment::Hash160(h) => compile_hash(out, OP_HASH160, h),
            Fragment::AndOr(x, y, z) => {
                x.compile_into(out)?;
                out.push(OP_NOTIF);
                z.compile_into(out)?;
                out.push(OP_ELSE);
                y.compile_into(out)?;
                out.push(OP_ENDIF);
            }
            Fragment::AndV(x, y) => {
                x.compile_into(out)?;
                y.compile_into(out)?;
            }
            Fragment::AndB(x, y) => {
                x.compile_into(out)?;
                y.compile_into(out)?;
                out.push(OP_BOOLAND);
            }
            Fragment::AndN(x, y) => {
                x.compile_into(out)?;
                out.extend_from_slice(&[OP_NOTIF, OP_0, OP_ELSE]);
                y.compile_into(out)?;
                out.push(OP_ENDIF);
            }
            Fragment::OrB(x, z) => {
                x.compile_into(out)?;
                z.compile_into(out)?;
                out.push(OP_BOOLOR);
            }
            Fragment::OrC(x, z) => {
                x.compile_into(out)?;
                out.push(OP_NOTIF);
                z.compile_into(out)?;
                out.push(OP_ENDIF);
            }
            Fragment::OrD(x, z) => {
                x.compile_into(out)?;
                out.extend_from_slice(&[OP_IFDUP, OP_NOTIF]);
                z.compile_into(out)?;
                out.push(OP_ENDIF);
            }
            Fragment::OrI(x, z) => {
                out.push(OP_IF);
                x.compile_into(out)?;
                out.push(OP_ELSE);
                z.compile_into(out)?;
                out.push(OP_ENDIF);
            }
            Fragment::Thresh(k, subs) => {
                for (i, sub) in subs.iter().enumerate() {
                    sub.compile_into(out)?;
                    if i > 0 {
                        out.push(OP_ADD);
                    }
                }
                push_number(out, *k as u64);
                out.push(OP_EQUAL);
            }
            Fragment::Multi(k, keys) => {
                push_number(out, *k as u64);
                for key in keys {
                    key.push_key(out)?;
                }
                push_number(out, keys.len() as u64);
                out.push(OP_CHECKMULTISIG);
            }
            Fragment::SortedMulti(k, keys) => {
                push_number(out, *k as u64);
                let mut pushes = keys
                    .iter()
                    .map(|key| {
                        let mut push = Vec::with_capacity(34);
                        key.push_key(&mut push).map(|_| push)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                pushes.sort();
                for push in pushes {
                    out.extend_from_slice(&push);
                }
                push_number(out, keys.len() as u64);
                out.push(OP_CHECKMULTISIG);
            }
            Fragment::Pk(key) => {
                key.push_key(out)?;
                out.push(OP_CHECKSIG);
            }
            Fragment::Pkh(key) => {
                out.extend_from_slice(&[OP_DUP, OP_HASH160]);
                key.push_key_hash(out)?;
                out.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            }
            Fragment::Wrap(w, x) => compile_wrapper(out, *w, x)?,
        }
        Ok(())
    }

    fn children(&self) -> Vec<&Miniscript> {
        match &self.fragment {
            Fragment::AndOr(x, y, z) => vec![&**x, &**y, &**z],
            Fragment::AndV(x, y)
            | Fragment::AndB(x, y)
            | Fragment::AndN(x, y)
            | Fragment::OrB(x, y)
            | Fragment::OrC(x, y)
            | Fragment::OrD(x, y)
            | Fragment::OrI(x, y) => vec![&**x, &**y],
            Fragment::Thresh(_, subs) => subs.iter().collect(),
            Fragment::Wrap(_, x) => vec![&**x],
            _ => Vec::new(),
        }
    }

    /// All keys in left-to-right order.
    pub fn keys(&self) -> Vec<&DescriptorKey> {
        let mut out = Vec::new();
        self.collect_keys(&mut out);
        out
    }

    fn collect_keys<'a>(&'a self, out: &mut Vec<&'a DescriptorKey>) {
        match &self.fragment {
            Fragment::PkK(k) | Fragment::PkH(k) | Fragment::Pk(k) | Fragment::Pkh(k) => out.push(k),
            Fragment::Multi(_, keys) | Fragment::SortedMulti(_, keys) => out.extend(keys.iter()),
            _ => {
                for child in self.children() {
                    child.collect_keys(out);
                }
            }
        }
    }

    /// Rebuild the tree with every key passed through `f`.
    pub fn map_keys<F>(&self, f: &mut F) -> Result<Miniscript, MiniscriptError>
    where
        F: FnMut(&DescriptorKey) -> Result<DescriptorKey, ArgumentError>,
    {
        let fragment = match &self.fragment {
            Fragment::PkK(k) => Fragment::PkK(f(k)?),
            Fragment::PkH(k) => Fragment::PkH(f(k)?),
            Fragment::Pk(k) => Fragment::Pk(f(k)?),
            Fragment::Pkh(k) => Fragment::Pkh(f(k)?),
            Fragment::Multi(n, keys) => {
                Fragment::Multi(*n, keys.iter().map(&mut *f).collect::<Result<_, _>>()?)
            }
            Fragment::SortedMulti(n, keys) => {
                Fragment::SortedMulti(*n, keys.iter().map(&mut *f).collect::<Result<_, _>>()?)
            }
            Fragment::AndOr(x, y, z) => Fragment::AndOr(x.map_boxed(f)?, y.map_boxed(f)?, z.map_boxed(f)?),
            Fragment::AndV(x, y) => Fragment::AndV(x.map_boxed(f)?, y.map_boxed(f)?),
            Fragment::AndB(x, y) => Fragment::AndB(x.map_boxed(f)?, y.map_boxed(f)?),
            Fragment::AndN(x, y) => Fragment::AndN(x.map_boxed(f)?, y.map_boxed(f)?),
            Fragment::OrB(x, y) => Fragment::OrB(x.map_boxed(f)?, y.map_boxed(f)?),
            Fragment::OrC(x, y) => Fragment::OrC(x.map_boxed(f)?, y.map_boxed(f)?),
            Fragment::OrD(x, y) => Fragment::OrD(x.map_boxed(f)?, y.map_boxed(f)?),
            Fragment::OrI(x, y) => Fragment::OrI(x.map_boxed(f)?, y.map_boxed(f)?),
            Fragment::Thresh(k, subs) => Fragment::Thresh(
                *k,
                subs.iter().map(|s| s.map_keys(f)).collect::<Result<_, _>>()?,
            ),
            Fragment::Wrap(w, x) => Fragment::Wrap(*w, x.map_boxed(f)?),
            other => other.clone(),
        };
        Ok(Miniscript::new(fragment))
    }

    fn map_boxed<F>(&self, f: &mut F) -> Result<Box<Miniscript>, MiniscriptError>
    where
        F: FnMut(&DescriptorKey) -> Result<DescriptorKey, ArgumentError>,
    {
        self.map_keys(f).map(Box::new)
    }

    /// Resolve every key's wildcard to `index` and branch set to `branch`.
    pub fn derive(&self, index: u32, branch: usize) -> Result<Miniscript, MiniscriptError> {
        self.map_keys(&mut |k| k.derive(index, branch))
    }

    /// Collapse every key's branch set to `branch`.
    pub fn branch(&self, branch: usize) -> Result<Miniscript, MiniscriptError> {
        self.map_keys(&mut |k| k.branch(branch))
    }

    /// Threshold of a top-level `multi`/`sortedmulti`.
    pub fn multisig_threshold(&self) -> Option<u32> {
        match &self.fragment {
            Fragment::Multi(k, _) | Fragment::SortedMulti(k, _) => Some(*k),
            _ => None,
        }
    }
}

fn compile_hash(out: &mut Vec<u8>, opcode: u8, hash: &[u8]) {
    out.push(OP_SIZE);
    push_number(out, 32);
    out.push(OP_EQUALVERIFY);
    out.push(opcode);
    push_data(out, hash);
    out.push(OP_EQUAL);
}

fn compile_wrapper(out: &mut Vec<u8>, w: Wrapper, x: &Miniscript) -> Result<(), MiniscriptError> {
    match w {
        Wrapper::A => {
            out.push(OP_TOALTSTACK);
            x.compile_into(out)?;
            out.push(OP_FROMALTSTACK);
        }
        Wrapper::S => {
            out.push(OP_SWAP);
            x.compile_into(out)?;
        }
        Wrapper::C => {
            x.compile_into(out)?;
            out.push(OP_CHECKSIG);
        }
        Wrapper::T => {
            x.compile_into(out)?;
            out.push(OP_1);
        }
        Wrapper::D => {
            out.extend_from_slice(&[OP_DUP, OP_IF]);
            x.compile_into(out)?;
            out.push(OP_ENDIF);
        }
        Wrapper::V => {
            x.compile_into(out)?;
            // CHECKSIG, CHECKMULTISIG, NUMEQUAL and EQUAL have VERIFY forms at +1
            match out.last_mut() {
                Some(last) if matches!(*last, OP_CHECKSIG | OP_CHECKMULTISIG | OP_NUMEQUAL | OP_EQUAL) => {
                    *last += 1
                }
                _ => out.push(OP_VERIFY),
            }
        }
        Wrapper::J => {
            out.extend_from_slice(&[OP_SIZE, OP_0NOTEQUAL, OP_IF]);
            x.compile_into(out)?;
            out.push(OP_ENDIF);
        }
        Wrapper::N => {
            x.compile_into(out)?;
            out.push(OP_0NOTEQUAL);
        }
        Wrapper::L => {
            out.extend_from_slice(&[OP_IF, OP_0, OP_ELSE]);
            x.compile_into(out)?;
            out.push(OP_ENDIF);
        }
        Wrapper::U => {
            out.push(OP_IF);
            x.compile_into(out)?;
            out.extend_from_slice(&[OP_ELSE, OP_0, OP_ENDIF]);
        }
    }
    Ok(())
}

fn read_arguments(cursor: &mut Cursor<'_>, operator: &Operator) -> Result<Vec<Arg>, MiniscriptError> {
    let mut args = Vec::new();
    match operator.arity {
        Arity::Fixed(n) => {
            for i in 0..n {
                let kind = if i == 0 { operator.first } else { operator.rest };
                args.push(read_argument(cursor, kind)?);
                if i + 1 < n && !cursor.eat(',') {
                    return Err(MiniscriptError::Parse(format!(
                        "{}: expected {} arguments",
                        operator.name, n
                    )));
                }
            }
            if !cursor.eat(')') {
                return Err(MiniscriptError::Parse(format!(
                    "{}: expected ) after {} arguments",
                    operator.name, n
                )));
            }
        }
        Arity::Variadic => {
            args.push(read_argument(cursor, operator.first)?);
            loop {
                match cursor.bump() {
                    Some(',') => args.push(read_argument(cursor, operator.rest)?),
                    Some(')') if args.len() > 1 => break,
                    other => {
                        return Err(MiniscriptError::Parse(format!(
                            "{}: expected , or ) but found {:?}",
                            operator.name, other
                        )))
                    }
                }
            }
        }
    }
    Ok(args)
}

fn read_argument(cursor: &mut Cursor<'_>, kind: ArgKind) -> Result<Arg, MiniscriptError> {
    Ok(match kind {
        ArgKind::Node => Arg::Node(Miniscript::parse_from(cursor)?),
        ArgKind::Key => Arg::Key(DescriptorKey::parse(cursor.take_key())?),
        ArgKind::KeyHash => Arg::Key(DescriptorKey::parse_key_hash(cursor.take_key())?),
        ArgKind::Number => {
            let digits = cursor.take_until(&[',', ')']);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MiniscriptError::Parse(format!("expected a number, got '{}'", digits)));
            }
            Arg::Number(
                digits
                    .parse()
                    .map_err(|_| MiniscriptError::Parse(format!("number out of range: {}", digits)))?,
            )
        }
        ArgKind::Hash32 => Arg::Hash32(read_hash(cursor)?),
        ArgKind::Hash20 => Arg::Hash20(read_hash(cursor)?),
    })
}

fn read_hash<const N: usize>(cursor: &mut Cursor<'_>) -> Result<[u8; N], MiniscriptError> {
    let text = cursor.take_until(&[',', ')']);
    let bytes = hex::decode(text).map_err(|e| MiniscriptError::Parse(format!("{}: {}", text, e)))?;
    bytes
        .try_into()
        .map_err(|_| MiniscriptError::Parse(format!("expected a {}-byte hash, got '{}'", N, text)))
}

impl fmt::Display for Miniscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, name: &str, k: u32, items: &[T]) -> fmt::Result {
            write!(f, "{}({}", name, k)?;
            for item in items {
                write!(f, ",{}", item)?;
            }
            f.write_str(")")
        }

        let name = self.name();
        match &self.fragment {
            Fragment::Zero | Fragment::One => f.write_str(name),
            Fragment::PkK(k) | Fragment::PkH(k) | Fragment::Pk(k) | Fragment::Pkh(k) => {
                write!(f, "{}({})", name, k)
            }
            Fragment::Older(n) | Fragment::After(n) => write!(f, "{}({})", name, n),
            Fragment::Sha256(h) | Fragment::Hash256(h) => write!(f, "{}({})", name, hex::encode(h)),
            Fragment::Ripemd160(h) | Fragment::Hash160(h) => write!(f, "{}({})", name, hex::encode(h)),
            Fragment::AndOr(x, y, z) => write!(f, "{}({},{},{})", name, x, y, z),
            Fragment::AndV(x, y)
            | Fragment::AndB(x, y)
            | Fragment::AndN(x, y)
            | Fragment::OrB(x, y)
            | Fragment::OrC(x, y)
            | Fragment::OrD(x, y)
            | Fragment::OrI(x, y) => write!(f, "{}({},{})", name, x, y),
            Fragment::Thresh(k, subs) => list(f, name, *k, subs),
            Fragment::Multi(k, keys) | Fragment::SortedMulti(k, keys) => list(f, name, *k, keys),
            Fragment::Wrap(w, x) => {
                if matches!(x.fragment, Fragment::Wrap(..)) {
                    write!(f, "{}{}", w.as_char(), x)
                } else {
                    write!(f, "{}:{}", w.as_char(), x)
                }
            }
        }
    }
}
