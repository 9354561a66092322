//! `WIDTH`/`HEIGHT` expressions on pass declarations.
//!
//! Grammar: numbers, `$VARIABLE`, `+ - * /`, unary minus, parentheses and the calls
//! `floor ceil round abs min max`. Variables are `$WIDTH`, `$HEIGHT` or a numeric input.

use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("unknown variable '${0}'")]
    UnknownVariable(String),

    #[error("expression evaluates to a non-finite value")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Floor,
    Ceil,
    Round,
    Abs,
    Min,
    Max,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "floor" => Func::Floor,
            "ceil" => Func::Ceil,
            "round" => Func::Round,
            "abs" => Func::Abs,
            "min" => Func::Min,
            "max" => Func::Max,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Func::Min | Func::Max => 2,
            _ => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Func::Floor => "floor",
            Func::Ceil => "ceil",
            Func::Round => "round",
            Func::Abs => "abs",
            Func::Min => "min",
            Func::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SizeExpr {
    Num(f64),
    Var(String),
    Neg(Box<SizeExpr>),
    Bin(BinOp, Box<SizeExpr>, Box<SizeExpr>),
    Call(Func, Vec<SizeExpr>),
}

impl SizeExpr {
    pub fn width() -> Self {
        SizeExpr::Var("WIDTH".to_string())
    }

    pub fn height() -> Self {
        SizeExpr::Var("HEIGHT".to_string())
    }

    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let mut p = Parser {
            chars: src.char_indices().collect(),
            pos: 0,
        };
        let e = p.expr()?;
        p.skip_ws();
        if let Some(&(at, ch)) = p.chars.get(p.pos) {
            return Err(ExprError::UnexpectedChar { ch, pos: at });
        }
        Ok(e)
    }

    /// Variable names (without `$`) in first-use order.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            SizeExpr::Num(_) => {}
            SizeExpr::Var(v) => {
                if !out.contains(&v.as_str()) {
                    out.push(v);
                }
            }
            SizeExpr::Neg(e) => e.collect_vars(out),
            SizeExpr::Bin(_, a, b) => {
                a.collect_vars(out);
                b.collect_vars(out);
            }
            SizeExpr::Call(_, args) => args.iter().for_each(|a| a.collect_vars(out)),
        }
    }

    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<f64>) -> Result<f64, ExprError> {
        let v = match self {
            SizeExpr::Num(n) => *n,
            SizeExpr::Var(name) => {
                lookup(name).ok_or_else(|| ExprError::UnknownVariable(name.clone()))?
            }
            SizeExpr::Neg(e) => -e.eval(lookup)?,
            SizeExpr::Bin(op, a, b) => {
                let (a, b) = (a.eval(lookup)?, b.eval(lookup)?);
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                }
            }
            SizeExpr::Call(f, args) => {
                let vals = args
                    .iter()
                    .map(|a| a.eval(lookup))
                    .collect::<Result<Vec<_>, _>>()?;
                match f {
                    Func::Floor => vals[0].floor(),
                    Func::Ceil => vals[0].ceil(),
                    Func::Round => vals[0].round(),
                    Func::Abs => vals[0].abs(),
                    Func::Min => vals[0].min(vals[1]),
                    Func::Max => vals[0].max(vals[1]),
                }
            }
        };
        if v.is_finite() {
            Ok(v)
        } else {
            Err(ExprError::NonFinite)
        }
    }
}

impl fmt::Display for SizeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeExpr::Num(n) => write!(f, "{n}"),
            SizeExpr::Var(v) => write!(f, "${v}"),
            SizeExpr::Neg(e) => write!(f, "-({e})"),
            SizeExpr::Bin(op, a, b) => {
                let op = match op {
                    BinOp::Add => '+',
                    BinOp::Sub => '-',
                    BinOp::Mul => '*',
                    BinOp::Div => '/',
                };
                write!(f, "({a} {op} {b})")
            }
            SizeExpr::Call(func, args) => {
                write!(f, "{}(", func.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
        }
    }
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser {
    fn skip_ws(&mut self) {
        while matches!(self.chars.get(self.pos), Some((_, c)) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn expect(&mut self, want: char) -> Result<(), ExprError> {
        match self.peek() {
            Some(c) if c == want => {
                self.pos += 1;
                Ok(())
            }
            Some(ch) => Err(ExprError::UnexpectedChar {
                ch,
                pos: self.chars[self.pos].0,
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<SizeExpr, ExprError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some('+') => BinOp::Add,
                Some('-') => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = SizeExpr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<SizeExpr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some('*') => BinOp::Mul,
                Some('/') => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = SizeExpr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<SizeExpr, ExprError> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(SizeExpr::Neg(Box::new(self.unary()?)))
            }
            Some('+') => {
                self.pos += 1;
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn ident(&mut self) -> String {
        let mut s = String::new();
        while let Some(&(_, c)) = self.chars.get(self.pos) {
            if c.is_ascii_alphanumeric() || c == '_' {
                s.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        s
    }

    fn atom(&mut self) -> Result<SizeExpr, ExprError> {
        let Some(c) = self.peek() else {
            return Err(ExprError::UnexpectedEnd);
        };
        let at = self.chars[self.pos].0;

        if c == '(' {
            self.pos += 1;
            let e = self.expr()?;
            self.expect(')')?;
            return Ok(e);
        }

        if c == '$' {
            self.pos += 1;
            let name = self.ident();
            if name.is_empty() {
                return match self.chars.get(self.pos) {
                    Some(&(pos, ch)) => Err(ExprError::UnexpectedChar { ch, pos }),
                    None => Err(ExprError::UnexpectedEnd),
                };
            }
            return Ok(SizeExpr::Var(name));
        }

        if c.is_ascii_digit() || c == '.' {
            let mut s = String::new();
            while let Some(&(_, d)) = self.chars.get(self.pos) {
                if d.is_ascii_digit() || d == '.' {
                    s.push(d);
                    self.pos += 1;
                } else {
                    break;
                }
            }
            return s
                .parse::<f64>()
                .map(SizeExpr::Num)
                .map_err(|_| ExprError::UnexpectedChar { ch: c, pos: at });
        }

        if c.is_ascii_alphabetic() {
            let name = self.ident();
            let func =
                Func::from_name(&name).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
            self.expect('(')?;
            let mut args = vec![self.expr()?];
            while self.peek() == Some(',') {
                self.pos += 1;
                args.push(self.expr()?);
            }
            self.expect(')')?;
            if args.len() != func.arity() {
                return Err(ExprError::Arity {
                    name,
                    expected: func.arity(),
                    got: args.len(),
                });
            }
            return Ok(SizeExpr::Call(func, args));
        }

        Err(ExprError::UnexpectedChar { ch: c, pos: at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, w: f64, h: f64) -> Result<f64, ExprError> {
        SizeExpr::parse(src)?.eval(&|v| match v {
            "WIDTH" => Some(w),
            "HEIGHT" => Some(h),
            "blurAmount" => Some(3.0),
            _ => None,
        })
    }

    #[test]
    fn half_width() {
        assert_eq!(eval("$WIDTH/2", 640.0, 480.0).unwrap(), 320.0);
    }

    #[test]
    fn precedence_and_functions() {
        assert_eq!(eval("floor($WIDTH * 0.3) + 1", 100.0, 0.0).unwrap(), 31.0);
        assert_eq!(eval("max($WIDTH, $HEIGHT) / -(-2)", 10.0, 40.0).unwrap(), 20.0);
        assert_eq!(eval("$HEIGHT / $blurAmount", 0.0, 9.0).unwrap(), 3.0);
    }

    #[test]
    fn unknown_variable_is_reported() {
        assert_eq!(
            eval("$DEPTH", 1.0, 1.0),
            Err(ExprError::UnknownVariable("DEPTH".into()))
        );
    }

    #[test]
    fn malformed_inputs() {
        assert!(matches!(SizeExpr::parse("$WIDTH /"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(
            SizeExpr::parse("sqrt($WIDTH)"),
            Err(ExprError::UnknownFunction(_))
        ));
        assert!(matches!(SizeExpr::parse("min(1)"), Err(ExprError::Arity { .. })));
        assert!(matches!(
            SizeExpr::parse("$WIDTH ) 2"),
            Err(ExprError::UnexpectedChar { ch: ')', .. })
        ));
    }

    #[test]
    fn division_by_zero_is_non_finite() {
        assert_eq!(eval("$WIDTH / 0", 4.0, 4.0), Err(ExprError::NonFinite));
    }

    #[test]
    fn variables_are_listed_once() {
        let e = SizeExpr::parse("$WIDTH + $blurAmount * $WIDTH").unwrap();
        assert_eq!(e.variables(), vec!["WIDTH", "blurAmount"]);
    }
}
