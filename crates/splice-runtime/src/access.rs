//! Uniform access to exports, whether held directly or behind a placeholder.

use crate::error::Error;
use crate::lazy::ResolutionState;
use crate::value::Value;
use crate::Result;

/// Something exports can be read and called through.
pub trait Access {
    /// Read a property. Missing properties read as `Null`.
    fn property(&self, name: &str) -> Result<Value>;

    /// Invoke as a function.
    fn call(&self, args: &[Value]) -> Result<Value>;

    fn state(&self) -> ResolutionState;
}

impl Access for Value {
    fn property(&self, name: &str) -> Result<Value> {
        Ok(self.get(name).cloned().unwrap_or_default())
    }

    fn call(&self, args: &[Value]) -> Result<Value> {
        let Value::Function(f) = self else {
            return Err(Error::NotCallable(self.to_string_value()));
        };
        match f.invoke(args) {
            Some(result) => result.map_err(|message| Error::CallFailed {
                name: f.name.clone(),
                message,
            }),
            None => Err(Error::CallFailed {
                name: f.name.clone(),
                message: "no native implementation".to_string(),
            }),
        }
    }

    fn state(&self) -> ResolutionState {
        ResolutionState::Resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Function;

    #[test]
    fn test_missing_property_is_null() {
        let v = Value::object([("a", Value::from(1.0))]);
        assert_eq!(v.property("a").unwrap(), Value::from(1.0));
        assert_eq!(v.property("b").unwrap(), Value::Null);
    }

    #[test]
    fn test_call_native() {
        let add = Value::Function(Function::native("add", "(a,b)=>a+b", |args| {
            let sum = args
                .iter()
                .map(|a| match a {
                    Value::Number(n) => *n,
                    _ => 0.0,
                })
                .sum::<f64>();
            Ok(Value::Number(sum))
        }));
        assert_eq!(add.call(&[Value::from(2.0), Value::from(3.0)]).unwrap(), Value::from(5.0));
    }

    #[test]
    fn test_call_errors() {
        assert!(matches!(Value::from(1.0).call(&[]), Err(Error::NotCallable(_))));
        let source_only = Value::Function(Function::new("f", "()=>1"));
        assert!(matches!(source_only.call(&[]), Err(Error::CallFailed { .. })));
        let failing = Value::Function(Function::native("f", "()=>{throw 1}", |_| Err("boom".into())));
        match failing.call(&[]) {
            Err(Error::CallFailed { name, message }) => {
                assert_eq!(name, "f");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
