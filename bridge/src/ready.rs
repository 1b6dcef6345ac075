use embedded_hal::digital::{OutputPin, PinState};

/// Active level of the RDY line, fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    fn asserted(self) -> PinState {
        match self {
            Polarity::ActiveHigh => PinState::High,
            Polarity::ActiveLow => PinState::Low,
        }
    }
}

/// RDY output towards the SPI master.
///
/// Asserted means a receive buffer is posted and the master may clock the next
/// transaction. The line is held asserted between transactions.
pub struct ReadyLine<P: OutputPin> {
    pin: P,
    polarity: Polarity,
}

impl<P: OutputPin> ReadyLine<P> {
    /// Takes ownership of the pin and drives it to the released level.
    pub fn new(pin: P, polarity: Polarity) -> Result<Self, P::Error> {
        let mut line = Self { pin, polarity };
        line.release()?;
        Ok(line)
    }

    pub fn assert(&mut self) -> Result<(), P::Error> {
        self.pin.set_state(self.polarity.asserted())
    }

    fn release(&mut self) -> Result<(), P::Error> {
        self.pin.set_state(!self.polarity.asserted())
    }

    #[cfg(test)]
    pub(crate) fn pin(&self) -> &P {
        &self.pin
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use core::convert::Infallible;
    use embedded_hal::digital::{ErrorType, OutputPin};
    use heapless::Vec;

    /// Records every level written to it.
    #[derive(Default)]
    pub struct RecordingPin {
        pub history: Vec<bool, 64>,
    }

    impl RecordingPin {
        pub fn level(&self) -> Option<bool> {
            self.history.last().copied()
        }
    }

    impl ErrorType for RecordingPin {
        type Error = Infallible;
    }

    impl OutputPin for RecordingPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            let _ = self.history.push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            let _ = self.history.push(true);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::RecordingPin;
    use super::*;

    #[test]
    fn test_active_high_starts_released() {
        let line = ReadyLine::new(RecordingPin::default(), Polarity::ActiveHigh).unwrap();
        assert_eq!(line.pin.level(), Some(false));
    }

    #[test]
    fn test_active_high_assert() {
        let mut line = ReadyLine::new(RecordingPin::default(), Polarity::ActiveHigh).unwrap();
        line.assert().unwrap();
        assert_eq!(line.pin.level(), Some(true));
        line.release().unwrap();
        assert_eq!(line.pin.level(), Some(false));
    }

    #[test]
    fn test_active_low_inverts_levels() {
        let mut line = ReadyLine::new(RecordingPin::default(), Polarity::ActiveLow).unwrap();
        assert_eq!(line.pin.level(), Some(true), "released active-low line idles high");
        line.assert().unwrap();
        assert_eq!(line.pin.level(), Some(false));
    }
}
