use std::ops::AddAssign;

/// Increments `value` and returns its previous value.
pub fn post_inc<T: From<u8> + Copy + AddAssign<T>>(value: &mut T) -> T {
    let prev = *value;
    *value += T::from(1);
    prev
}

pub trait ResultExt<E> {
    type Ok;

    fn log_err(self) -> Option<Self::Ok>;
    fn warn_on_err(self) -> Option<Self::Ok>;
}

impl<T, E> ResultExt<E> for Result<T, E>
where
    E: std::fmt::Debug,
{
    type Ok = T;

    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                log::error!("{}:{}: {:?}", caller.file(), caller.line(), error);
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                log::warn!("{}:{}: {:?}", caller.file(), caller.line(), error);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_inc() {
        let mut next_id = 3_usize;
        assert_eq!(post_inc(&mut next_id), 3);
        assert_eq!(post_inc(&mut next_id), 4);
        assert_eq!(next_id, 5);
    }

    #[test]
    fn test_log_err_passes_ok_through() {
        let ok: Result<u32, String> = Ok(7);
        assert_eq!(ok.log_err(), Some(7));
        let err: Result<u32, String> = Err("nope".into());
        assert_eq!(err.log_err(), None);
    }
}
